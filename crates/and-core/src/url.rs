//! Peer URLs: `and://<identity-hash>@<host:port>/<path>`.
//!
//! The identity hash names who we expect to reach, the address says where,
//! and the path names a world on that peer.

use crate::ids::{IdError, IdentityHash};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use url::Url;

pub const SCHEME: &str = "and";

#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Invalid URL: {0}")]
    Parse(#[from] url::ParseError),
    #[error("Unsupported scheme {0:?}, expected \"and\"")]
    Scheme(String),
    #[error("Invalid identity in URL: {0}")]
    Identity(#[from] IdError),
    #[error("URL has no host:port address")]
    MissingAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerUrl {
    pub identity: IdentityHash,
    /// `host:port`
    pub address: String,
    /// World path, without the leading slash.
    pub path: String,
}

impl PeerUrl {
    pub fn new(identity: IdentityHash, address: impl Into<String>) -> Self {
        Self {
            identity,
            address: address.into(),
            path: String::new(),
        }
    }

    /// Same peer, different world path.
    pub fn with_path(&self, path: &str) -> Self {
        Self {
            identity: self.identity,
            address: self.address.clone(),
            path: path.trim_start_matches('/').to_string(),
        }
    }
}

impl Display for PeerUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}://{}@{}/{}", self.identity, self.address, self.path)
    }
}

impl FromStr for PeerUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = Url::parse(s)?;
        if parsed.scheme() != SCHEME {
            return Err(UrlError::Scheme(parsed.scheme().to_string()));
        }
        let identity: IdentityHash = parsed.username().parse()?;
        let host = parsed.host_str().ok_or(UrlError::MissingAddress)?;
        let port = parsed.port().ok_or(UrlError::MissingAddress)?;
        Ok(Self {
            identity,
            address: format!("{host}:{port}"),
            path: parsed.path().trim_start_matches('/').to_string(),
        })
    }
}

impl serde::Serialize for PeerUrl {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerUrl {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash() -> IdentityHash {
        IdentityHash::of_certificate(b"peer")
    }

    #[test]
    fn test_parse_full_url() {
        let text = format!("and://{}@127.0.0.1:9427/lobby", hash());
        let url: PeerUrl = text.parse().unwrap();
        assert_eq!(url.identity, hash());
        assert_eq!(url.address, "127.0.0.1:9427");
        assert_eq!(url.path, "lobby");
        assert_eq!(url.to_string(), text);
    }

    #[test]
    fn test_parse_without_path() {
        let url: PeerUrl = format!("and://{}@example.net:1", hash()).parse().unwrap();
        assert_eq!(url.path, "");
    }

    #[test]
    fn test_rejects_other_scheme() {
        let result = format!("ws://{}@127.0.0.1:1/w", hash()).parse::<PeerUrl>();
        assert!(matches!(result, Err(UrlError::Scheme(s)) if s == "ws"));
    }

    #[test]
    fn test_rejects_missing_port() {
        let result = format!("and://{}@127.0.0.1/w", hash()).parse::<PeerUrl>();
        assert!(matches!(result, Err(UrlError::MissingAddress)));
    }

    #[test]
    fn test_rejects_bad_identity() {
        let result = "and://nobody@127.0.0.1:1/w".parse::<PeerUrl>();
        assert!(matches!(result, Err(UrlError::Identity(_))));
    }

    #[test]
    fn test_with_path_strips_leading_slash() {
        let url = PeerUrl::new(hash(), "127.0.0.1:1").with_path("/rooms");
        assert_eq!(url.path, "rooms");
    }
}
