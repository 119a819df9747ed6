//! Transport abstractions for peer-to-peer channels.
//!
//! A transport hands the host authenticated peers (`InboundPeer`), each with
//! a stream of decoded AHMP messages, plus separate content channels.
//!
//! Implementations:
//! - `MemoryTransport`: in-process network for tests
//! - WebSocket transport: lives in the host crate

pub mod memory;

use crate::identity::{LocalIdentity, PeerCertificates};
use crate::ids::IdentityHash;
use crate::protocol::AhmpMessage;
use crate::url::PeerUrl;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryNetwork, MemoryPeer, MemoryTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A connected, authenticated remote peer.
pub trait AndPeer: Send + Sync + fmt::Debug {
    fn identity(&self) -> &IdentityHash;

    /// Where the peer listens, as it advertised during the handshake.
    fn url(&self) -> &PeerUrl;

    fn certificates(&self) -> &PeerCertificates;

    /// Queue a message for delivery. Never blocks.
    fn send(&self, message: AhmpMessage) -> Result<()>;
}

/// A newly connected peer and the messages it sends us.
#[derive(Debug)]
pub struct InboundPeer {
    pub peer: Arc<dyn AndPeer>,
    pub messages: mpsc::UnboundedReceiver<AhmpMessage>,
}

/// Byte channel to a peer for content transfer, separate from AHMP traffic.
#[derive(Debug)]
pub struct ContentSession {
    peer: IdentityHash,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ContentSession {
    pub fn new(
        peer: IdentityHash,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self { peer, tx, rx }
    }

    /// Two connected ends: the first is `a`'s view of `b`, the second `b`'s view of `a`.
    pub fn pair(a: IdentityHash, b: IdentityHash) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::new(b, a_tx, a_rx), Self::new(a, b_tx, b_rx))
    }

    pub fn peer(&self) -> &IdentityHash {
        &self.peer
    }

    pub fn send(&self, data: Vec<u8>) -> Result<()> {
        self.tx.send(data).map_err(|_| TransportError::Closed)
    }

    /// Next chunk from the peer, `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Transport layer used by the host.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_identity(&self) -> &LocalIdentity;

    /// URL other peers use to reach us (empty path).
    fn local_url(&self) -> PeerUrl;

    /// Next authenticated inbound or outbound peer. `None` once closed.
    async fn accept(&self) -> Option<InboundPeer>;

    /// Start connecting to `url` in the background. Success surfaces through `accept`.
    fn connect(&self, url: &PeerUrl);

    /// Open a content channel to an already known peer.
    async fn connect_content(&self, peer: &IdentityHash) -> Result<ContentSession>;

    /// Next content channel opened by a remote peer. `None` once closed.
    async fn accept_content(&self) -> Option<ContentSession>;

    /// Remember a peer's certificates ahead of connecting to it.
    fn register_trusted(&self, certificates: PeerCertificates);

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_content_pair_is_cross_wired() {
        let a = IdentityHash::of_certificate(b"a");
        let b = IdentityHash::of_certificate(b"b");
        let (mut at_a, mut at_b) = ContentSession::pair(a, b);

        assert_eq!(at_a.peer(), &b);
        assert_eq!(at_b.peer(), &a);

        at_a.send(b"hello".to_vec()).unwrap();
        assert_eq!(at_b.recv().await.unwrap(), b"hello");
        at_b.send(b"back".to_vec()).unwrap();
        assert_eq!(at_a.recv().await.unwrap(), b"back");
    }

    #[tokio::test]
    async fn test_content_closed_when_other_end_dropped() {
        let a = IdentityHash::of_certificate(b"a");
        let b = IdentityHash::of_certificate(b"b");
        let (at_a, mut at_b) = ContentSession::pair(a, b);
        drop(at_a);
        assert!(at_b.recv().await.is_none());
    }
}
