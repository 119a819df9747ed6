//! Peer certificates and the local node identity.

use crate::ids::IdentityHash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The certificate pair a peer presents: a long-lived root and a
/// handshake certificate used for channel setup.
///
/// Both travel as hex strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCertificates {
    #[serde(with = "hex_bytes")]
    pub root: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub handshake: Vec<u8>,
}

impl PeerCertificates {
    pub fn new(root: Vec<u8>, handshake: Vec<u8>) -> Self {
        Self { root, handshake }
    }

    /// Identity derived from the root certificate.
    pub fn identity(&self) -> IdentityHash {
        IdentityHash::of_certificate(&self.root)
    }

    /// True if these certificates belong to `claimed`.
    pub fn matches(&self, claimed: &IdentityHash) -> bool {
        self.identity() == *claimed
    }
}

/// This node's identity: its certificates and the hash derived from them.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    certificates: PeerCertificates,
    hash: IdentityHash,
}

impl LocalIdentity {
    pub fn new(certificates: PeerCertificates) -> Self {
        let hash = certificates.identity();
        Self { certificates, hash }
    }

    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let root: [u8; 32] = rand::random();
        let handshake: [u8; 32] = rand::random();
        Self::new(PeerCertificates::new(root.to_vec(), handshake.to_vec()))
    }

    /// Deterministic identity derived from a seed string.
    ///
    /// The same seed always yields the same identity hash.
    pub fn from_seed(seed: &str) -> Self {
        let root = format!("and-root:{seed}").into_bytes();
        let handshake = Sha256::digest(&root).to_vec();
        Self::new(PeerCertificates::new(root, handshake))
    }

    pub fn hash(&self) -> &IdentityHash {
        &self.hash
    }

    pub fn certificates(&self) -> &PeerCertificates {
        &self.certificates
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identities_differ() {
        let a = LocalIdentity::generate();
        let b = LocalIdentity::generate();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_seeded_identity_is_stable() {
        let a = LocalIdentity::from_seed("alice");
        let b = LocalIdentity::from_seed("alice");
        let c = LocalIdentity::from_seed("bob");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_hash_derives_from_root_certificate() {
        let id = LocalIdentity::from_seed("alice");
        assert_eq!(*id.hash(), IdentityHash::of_certificate(&id.certificates().root));
        assert!(id.certificates().matches(id.hash()));
    }

    #[test]
    fn test_certificates_serialize_as_hex() {
        let certs = PeerCertificates::new(vec![0xab, 0xcd], vec![0x01]);
        let json = serde_json::to_string(&certs).unwrap();
        assert_eq!(json, r#"{"root":"abcd","handshake":"01"}"#);
        let back: PeerCertificates = serde_json::from_str(&json).unwrap();
        assert_eq!(back, certs);
    }

    #[test]
    fn test_certificates_reject_bad_hex() {
        let result: Result<PeerCertificates, _> =
            serde_json::from_str(r#"{"root":"xyz","handshake":"01"}"#);
        assert!(result.is_err());
    }
}
