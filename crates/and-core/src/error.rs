//! Engine result codes.

use thiserror::Error;

/// Numeric result codes shared with embedding layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    /// EINVAL: the input was not acceptable in the current state.
    Invalid = 22,
    /// ENOTRECOVERABLE: internal state is corrupted.
    Corrupted = 131,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AndError {
    /// Rejected input. Recoverable: state is unchanged.
    #[error("invalid: {0}")]
    Invalid(String),

    /// An internal invariant broke. Not recoverable.
    #[error("corrupted: {0}")]
    Corrupted(String),
}

impl AndError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }

    pub fn code(&self) -> ResultCode {
        match self {
            Self::Invalid(_) => ResultCode::Invalid,
            Self::Corrupted(_) => ResultCode::Corrupted,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupted(_))
    }
}

pub type AndResult<T = ()> = std::result::Result<T, AndError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(AndError::invalid("x").code() as i32, 22);
        assert_eq!(AndError::Corrupted("x".into()).code() as i32, 131);
        assert_eq!(ResultCode::Ok as i32, 0);
    }

    #[test]
    fn test_only_corrupted_is_fatal() {
        assert!(!AndError::invalid("x").is_fatal());
        assert!(AndError::Corrupted("x".into()).is_fatal());
    }
}
