//! In-process transport for tests.
//!
//! A `MemoryNetwork` connects any number of `MemoryTransport`s. Connecting two
//! nodes creates a link that shows up in both nodes' `accept()` streams, just
//! like a real connection would. Links can be cut with `disconnect`.

use super::{AndPeer, ContentSession, InboundPeer, PeerTransport, Result, TransportError};
use crate::identity::{LocalIdentity, PeerCertificates};
use crate::ids::IdentityHash;
use crate::protocol::AhmpMessage;
use crate::url::PeerUrl;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct MemoryNode {
    url: PeerUrl,
    certificates: PeerCertificates,
    accept_tx: mpsc::UnboundedSender<InboundPeer>,
    content_tx: mpsc::UnboundedSender<ContentSession>,
    /// Our handle for each linked remote, keyed by remote identity.
    links: HashMap<IdentityHash, Arc<MemoryPeer>>,
    trusted: HashSet<IdentityHash>,
}

/// Shared registry of in-process nodes.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<IdentityHash, MemoryNode>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with an identity derived from `name`.
    pub fn transport(&self, name: &str) -> Arc<MemoryTransport> {
        let identity = LocalIdentity::from_seed(name);
        let url = PeerUrl::new(*identity.hash(), format!("{name}.mem:1"));
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (content_tx, content_rx) = mpsc::unbounded_channel();

        self.lock().insert(
            *identity.hash(),
            MemoryNode {
                url: url.clone(),
                certificates: identity.certificates().clone(),
                accept_tx,
                content_tx,
                links: HashMap::new(),
                trusted: HashSet::new(),
            },
        );

        Arc::new(MemoryTransport {
            network: self.clone(),
            identity,
            url,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            content_rx: tokio::sync::Mutex::new(content_rx),
        })
    }

    /// Create a link between `a` and `b` if both exist and are not yet linked.
    pub fn link(&self, a: &IdentityHash, b: &IdentityHash) {
        if a == b {
            return;
        }
        let mut nodes = self.lock();
        let (Some(node_a), Some(node_b)) = (nodes.get(a), nodes.get(b)) else {
            warn!("memory link {} <-> {}: unknown node", a.short(), b.short());
            return;
        };
        if node_a.links.contains_key(b) {
            return;
        }

        let (to_b_tx, to_b_rx) = mpsc::unbounded_channel();
        let (to_a_tx, to_a_rx) = mpsc::unbounded_channel();
        let b_at_a = Arc::new(MemoryPeer::new(
            node_b.url.clone(),
            node_b.certificates.clone(),
            to_b_tx,
        ));
        let a_at_b = Arc::new(MemoryPeer::new(
            node_a.url.clone(),
            node_a.certificates.clone(),
            to_a_tx,
        ));

        let _ = node_a.accept_tx.send(InboundPeer {
            peer: b_at_a.clone(),
            messages: to_a_rx,
        });
        let _ = node_b.accept_tx.send(InboundPeer {
            peer: a_at_b.clone(),
            messages: to_b_rx,
        });

        if let Some(node) = nodes.get_mut(a) {
            node.links.insert(*b, b_at_a);
        }
        if let Some(node) = nodes.get_mut(b) {
            node.links.insert(*a, a_at_b);
        }
        debug!("memory link {} <-> {}", a.short(), b.short());
    }

    /// Cut the link between `a` and `b`. Both sides see their message stream end.
    pub fn disconnect(&self, a: &IdentityHash, b: &IdentityHash) {
        let mut nodes = self.lock();
        for (from, to) in [(a, b), (b, a)] {
            if let Some(peer) = nodes.get_mut(from).and_then(|n| n.links.remove(to)) {
                peer.close();
            }
        }
    }

    pub fn is_linked(&self, a: &IdentityHash, b: &IdentityHash) -> bool {
        self.lock()
            .get(a)
            .is_some_and(|node| node.links.contains_key(b))
    }

    pub fn is_trusted(&self, node: &IdentityHash, peer: &IdentityHash) -> bool {
        self.lock()
            .get(node)
            .is_some_and(|n| n.trusted.contains(peer))
    }

    fn open_content(&self, from: &IdentityHash, to: &IdentityHash) -> Result<ContentSession> {
        let nodes = self.lock();
        let remote = nodes
            .get(to)
            .ok_or_else(|| TransportError::PeerNotFound(to.to_string()))?;
        let (local_end, remote_end) = ContentSession::pair(*from, *to);
        remote
            .content_tx
            .send(remote_end)
            .map_err(|_| TransportError::ConnectionFailed(format!("{} is closed", to.short())))?;
        Ok(local_end)
    }

    fn trust(&self, node: &IdentityHash, peer: IdentityHash) {
        if let Some(n) = self.lock().get_mut(node) {
            n.trusted.insert(peer);
        }
    }

    fn remove(&self, node: &IdentityHash) {
        let removed = self.lock().remove(node);
        let Some(removed) = removed else {
            return;
        };
        for (remote, peer) in removed.links {
            peer.close();
            if let Some(back) = self
                .lock()
                .get_mut(&remote)
                .and_then(|n| n.links.remove(node))
            {
                back.close();
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IdentityHash, MemoryNode>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One end of a memory link.
#[derive(Debug)]
pub struct MemoryPeer {
    url: PeerUrl,
    certificates: PeerCertificates,
    tx: Mutex<Option<mpsc::UnboundedSender<AhmpMessage>>>,
}

impl MemoryPeer {
    fn new(
        url: PeerUrl,
        certificates: PeerCertificates,
        tx: mpsc::UnboundedSender<AhmpMessage>,
    ) -> Self {
        Self {
            url,
            certificates,
            tx: Mutex::new(Some(tx)),
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl AndPeer for MemoryPeer {
    fn identity(&self) -> &IdentityHash {
        &self.url.identity
    }

    fn url(&self) -> &PeerUrl {
        &self.url
    }

    fn certificates(&self) -> &PeerCertificates {
        &self.certificates
    }

    fn send(&self, message: AhmpMessage) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| {
                TransportError::SendFailed(format!("{} stopped reading", self.url.identity.short()))
            }),
            None => Err(TransportError::Closed),
        }
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    identity: LocalIdentity,
    url: PeerUrl,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundPeer>>,
    content_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ContentSession>>,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn hash(&self) -> IdentityHash {
        *self.identity.hash()
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_identity(&self) -> &LocalIdentity {
        &self.identity
    }

    fn local_url(&self) -> PeerUrl {
        self.url.clone()
    }

    async fn accept(&self) -> Option<InboundPeer> {
        self.accept_rx.lock().await.recv().await
    }

    fn connect(&self, url: &PeerUrl) {
        self.network.link(self.identity.hash(), &url.identity);
    }

    async fn connect_content(&self, peer: &IdentityHash) -> Result<ContentSession> {
        self.network.open_content(self.identity.hash(), peer)
    }

    async fn accept_content(&self) -> Option<ContentSession> {
        self.content_rx.lock().await.recv().await
    }

    fn register_trusted(&self, certificates: PeerCertificates) {
        self.network.trust(self.identity.hash(), certificates.identity());
    }

    async fn close(&self) {
        self.network.remove(self.identity.hash());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;

    fn rst() -> AhmpMessage {
        AhmpMessage::Rst {
            recver: SessionId::generate(),
            sender: SessionId::generate(),
        }
    }

    #[tokio::test]
    async fn test_link_surfaces_on_both_sides() {
        let net = MemoryNetwork::new();
        let a = net.transport("a");
        let b = net.transport("b");

        a.connect(&b.local_url());

        let at_a = a.accept().await.unwrap();
        let mut at_b = b.accept().await.unwrap();
        assert_eq!(at_a.peer.identity(), &b.hash());
        assert_eq!(at_b.peer.identity(), &a.hash());

        let msg = rst();
        at_a.peer.send(msg.clone()).unwrap();
        assert_eq!(at_b.messages.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_second_connect_is_ignored() {
        let net = MemoryNetwork::new();
        let a = net.transport("a");
        let b = net.transport("b");

        a.connect(&b.local_url());
        b.connect(&a.local_url());

        assert!(net.is_linked(&a.hash(), &b.hash()));
        let _first = a.accept().await.unwrap();
        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), a.accept()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams() {
        let net = MemoryNetwork::new();
        let a = net.transport("a");
        let b = net.transport("b");
        a.connect(&b.local_url());
        let at_a = a.accept().await.unwrap();
        let mut at_b = b.accept().await.unwrap();

        net.disconnect(&a.hash(), &b.hash());

        assert!(at_b.messages.recv().await.is_none());
        assert!(matches!(at_a.peer.send(rst()), Err(TransportError::Closed)));
        assert!(!net.is_linked(&a.hash(), &b.hash()));
    }

    #[tokio::test]
    async fn test_close_ends_accept() {
        let net = MemoryNetwork::new();
        let a = net.transport("a");
        a.close().await;
        assert!(a.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_content_channel() {
        let net = MemoryNetwork::new();
        let a = net.transport("a");
        let b = net.transport("b");

        let mut local = a.connect_content(&b.hash()).await.unwrap();
        let mut remote = b.accept_content().await.unwrap();
        assert_eq!(remote.peer(), &a.hash());

        local.send(b"chunk".to_vec()).unwrap();
        assert_eq!(remote.recv().await.unwrap(), b"chunk");
        remote.send(b"ack".to_vec()).unwrap();
        assert_eq!(local.recv().await.unwrap(), b"ack");
    }

    #[tokio::test]
    async fn test_content_to_unknown_peer_fails() {
        let net = MemoryNetwork::new();
        let a = net.transport("a");
        let ghost = IdentityHash::of_certificate(b"ghost");
        assert!(matches!(
            a.connect_content(&ghost).await,
            Err(TransportError::PeerNotFound(_))
        ));
    }

    #[test]
    fn test_register_trusted() {
        let net = MemoryNetwork::new();
        let a = net.transport("a");
        let carol = LocalIdentity::from_seed("carol");
        a.register_trusted(carol.certificates().clone());
        assert!(net.is_trusted(&a.hash(), carol.hash()));
    }
}
