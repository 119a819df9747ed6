//! Handshake exchanged on every WebSocket channel.
//!
//! The handshake is JSON sent as a binary WebSocket frame. The connecting side
//! sends first; the accepting side answers with its own handshake for the
//! same role. After that the channel carries AHMP messages (`ahmp`) or raw
//! content bytes (`content`).

use and_core::{IdentityHash, PeerCertificates, PeerUrl};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB) accepted from a peer.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    /// Membership protocol traffic
    Ahmp,
    /// Content transfer
    Content,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Always "handshake"
    #[serde(rename = "type")]
    pub msg_type: String,

    pub version: u32,

    /// Claimed identity; must be the hash of `certificates.root`
    pub identity: IdentityHash,

    pub certificates: PeerCertificates,

    /// Where the sender accepts connections (`host:port`)
    pub address: String,

    pub role: ChannelRole,
}

impl HandshakeMessage {
    pub fn new(certificates: &PeerCertificates, address: &str, role: ChannelRole) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            version: PROTOCOL_VERSION,
            identity: certificates.identity(),
            certificates: certificates.clone(),
            address: address.to_string(),
            role,
        }
    }

    /// Serialize to UTF-8 JSON bytes for sending as binary WebSocket frame.
    pub fn to_binary(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("HandshakeMessage serialization should not fail")
    }

    /// Try to parse a handshake from binary data.
    ///
    /// Returns None if the data is not valid UTF-8 JSON or not a handshake message.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let msg: Self = serde_json::from_str(text).ok()?;

        if msg.msg_type == "handshake" {
            Some(msg)
        } else {
            None
        }
    }

    /// The claimed identity really belongs to the presented certificate.
    pub fn is_authentic(&self) -> bool {
        self.certificates.matches(&self.identity)
    }

    /// The sender's listening URL.
    pub fn url(&self) -> PeerUrl {
        PeerUrl::new(self.identity, self.address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use and_core::LocalIdentity;

    #[test]
    fn test_handshake_roundtrip() {
        let identity = LocalIdentity::from_seed("a");
        let msg = HandshakeMessage::new(identity.certificates(), "127.0.0.1:9000", ChannelRole::Ahmp);
        let parsed = HandshakeMessage::from_binary(&msg.to_binary()).unwrap();

        assert_eq!(parsed.msg_type, "handshake");
        assert_eq!(parsed.version, PROTOCOL_VERSION);
        assert_eq!(parsed.identity, *identity.hash());
        assert_eq!(parsed.role, ChannelRole::Ahmp);
        assert!(parsed.is_authentic());
        assert_eq!(parsed.url().address, "127.0.0.1:9000");
    }

    #[test]
    fn test_role_wire_names() {
        let identity = LocalIdentity::from_seed("a");
        let msg = HandshakeMessage::new(identity.certificates(), "h:1", ChannelRole::Content);
        let json: serde_json::Value = serde_json::from_slice(&msg.to_binary()).unwrap();

        assert_eq!(json["type"], "handshake");
        assert_eq!(json["role"], "content");
        assert_eq!(json["identity"], identity.hash().to_string());
    }

    #[test]
    fn test_forged_identity_is_not_authentic() {
        let real = LocalIdentity::from_seed("a");
        let other = LocalIdentity::from_seed("b");
        let mut msg = HandshakeMessage::new(real.certificates(), "h:1", ChannelRole::Ahmp);
        msg.identity = *other.hash();

        assert!(!msg.is_authentic());
    }

    #[test]
    fn test_invalid_json_returns_none() {
        assert!(HandshakeMessage::from_binary(b"not json at all").is_none());
    }

    #[test]
    fn test_non_handshake_json_returns_none() {
        let other_json = br#"{"type": "MEM", "recver": "x", "sender": "y"}"#;
        assert!(HandshakeMessage::from_binary(other_json).is_none());
    }
}
