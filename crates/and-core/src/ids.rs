//! Identifiers used by the neighbor discovery engine.
//!
//! - `IdentityHash`: SHA-256 of a peer's root certificate, displayed as 64 hex chars
//! - `SessionId`: minted locally for every world participation
//! - `ObjectId`: names an object announced into a world

use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("Invalid identity hash: expected 64 hex chars")]
    InvalidIdentityHash,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("Invalid id: {0}")]
    InvalidUuid(#[from] uuid::Error),
}

/// Cryptographic identity of a peer.
///
/// Derived from the DER bytes of the peer's root certificate, so two peers
/// presenting the same root certificate are the same identity.
///
/// # Examples
/// ```
/// use and_core::IdentityHash;
///
/// let hash = IdentityHash::of_certificate(b"root certificate");
/// let parsed: IdentityHash = hash.to_string().parse().unwrap();
/// assert_eq!(hash, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityHash([u8; 32]);

impl IdentityHash {
    pub fn of_certificate(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Display for IdentityHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for IdentityHash {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(IdError::InvalidIdentityHash);
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

// Serialize as hex string for consistency in logs, errors, JSON
impl serde::Serialize for IdentityHash {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for IdentityHash {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifies one participation in one world on one node.
///
/// Never reused: once a session is closed or its join fails, the id is retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for SessionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Names an object a member announces into a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for ObjectId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_hash_is_sha256_of_certificate() {
        // sha256("abc")
        let hash = IdentityHash::of_certificate(b"abc");
        assert_eq!(
            hash.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_identity_hash_parse_uppercase() {
        let hash = IdentityHash::of_certificate(b"abc");
        let parsed: IdentityHash = hash.to_string().to_ascii_uppercase().parse().unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_identity_hash_rejects_wrong_length() {
        assert!("abcd".parse::<IdentityHash>().is_err());
        assert!("".parse::<IdentityHash>().is_err());
    }

    #[test]
    fn test_identity_hash_rejects_non_hex() {
        let bad = "z".repeat(64);
        assert!(matches!(
            bad.parse::<IdentityHash>(),
            Err(IdError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_identity_hash_short() {
        let hash = IdentityHash::of_certificate(b"abc");
        assert_eq!(hash.short(), "ba7816bf");
    }

    #[test]
    fn test_identity_hash_serde_as_string() {
        let hash = IdentityHash::of_certificate(b"abc");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash));
        let back: IdentityHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_id_parse_display() {
        let id = SessionId::generate();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_session_id_bytes() {
        let id = SessionId::from_bytes([7u8; 16]);
        assert_eq!(id.as_bytes(), &[7u8; 16]);
    }
}
