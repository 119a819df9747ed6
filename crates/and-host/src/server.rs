//! WebSocket implementation of `PeerTransport`.
//!
//! One listener accepts both AHMP and content channels; the handshake role
//! tells them apart. At most one AHMP connection is kept per identity, no
//! matter which side dialed.

use crate::connection::{self, WsPeer};
use crate::message::{ChannelRole, HandshakeMessage};
use and_core::transport::Result;
use and_core::{
    AndPeer, ContentSession, IdentityHash, InboundPeer, LocalIdentity, PeerCertificates,
    PeerTransport, PeerUrl, TransportError,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, error, info, warn};

struct Shared {
    identity: LocalIdentity,
    url: PeerUrl,
    accept_tx: Mutex<Option<mpsc::UnboundedSender<InboundPeer>>>,
    content_tx: Mutex<Option<mpsc::UnboundedSender<ContentSession>>>,
    /// Live AHMP connections by remote identity
    connected: Mutex<HashMap<IdentityHash, Arc<WsPeer>>>,
    dialing: Mutex<HashSet<IdentityHash>>,
    /// Last advertised address per identity, for content channels
    addresses: Mutex<HashMap<IdentityHash, String>>,
    trusted: Mutex<HashMap<IdentityHash, PeerCertificates>>,
}

pub struct WsTransport {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundPeer>>,
    content_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ContentSession>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Listen on `listen_addr` (port 0 picks a free port) as `identity`.
    pub async fn bind(listen_addr: &str, identity: LocalIdentity) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("bind {listen_addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let url = PeerUrl::new(*identity.hash(), local_addr.to_string());
        info!("WebSocket transport listening on {} as {}", local_addr, url);

        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (content_tx, content_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            identity,
            url,
            accept_tx: Mutex::new(Some(accept_tx)),
            content_tx: Mutex::new(Some(content_tx)),
            connected: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            addresses: Mutex::new(HashMap::new()),
            trusted: Mutex::new(HashMap::new()),
        });

        let listener_task = tokio::spawn(listen(shared.clone(), listener));

        Ok(Arc::new(Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            content_rx: tokio::sync::Mutex::new(content_rx),
            listener_task: Mutex::new(Some(listener_task)),
        }))
    }

    pub fn connected_count(&self) -> usize {
        lock(&self.shared.connected).len()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.listener_task).take() {
            task.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

async fn listen(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(accept_connection(shared.clone(), stream, addr));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn accept_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            // Health checks (like `nc -z`) connect and immediately close without
            // completing the WebSocket handshake.
            let err_str = e.to_string();
            if err_str.contains("Handshake not finished")
                || err_str.contains("Connection reset")
                || err_str.contains("unexpected EOF")
            {
                debug!("Connection closed before handshake from {}", addr);
            } else {
                error!("WebSocket upgrade failed for {}: {}", addr, e);
            }
            return;
        }
    };

    let remote = match connection::server_handshake(
        &mut ws,
        shared.identity.certificates(),
        &shared.url.address,
    )
    .await
    {
        Ok(remote) => remote,
        Err(e) => {
            warn!("Rejected connection from {}: {}", addr, e);
            return;
        }
    };
    debug!(
        "Handshake from {} ({}, {:?})",
        addr,
        remote.identity.short(),
        remote.role
    );

    match remote.role {
        ChannelRole::Ahmp => register(&shared, ws, remote),
        ChannelRole::Content => {
            let session = connection::spawn_content(ws, remote.identity);
            if let Some(tx) = lock(&shared.content_tx).as_ref() {
                let _ = tx.send(session);
            }
        }
    }
}

/// Take over a handshaken AHMP connection unless we already have one to that identity.
fn register<S>(shared: &Arc<Shared>, ws: WebSocketStream<S>, remote: HandshakeMessage)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let identity = remote.identity;
    if identity == *shared.identity.hash() {
        debug!("Dropping connection to ourselves");
        return;
    }
    if let Some(known) = lock(&shared.trusted).get(&identity)
        && *known != remote.certificates
    {
        warn!(
            "Peer {} presented certificates that differ from the trusted ones",
            identity.short()
        );
        return;
    }

    let mut connected = lock(&shared.connected);
    if connected.contains_key(&identity) {
        debug!("Already connected to {}, dropping duplicate", identity.short());
        return;
    }
    let Some(accept_tx) = lock(&shared.accept_tx).clone() else {
        return;
    };

    let on_close = {
        let shared = Arc::downgrade(shared);
        move || {
            if let Some(shared) = shared.upgrade() {
                lock(&shared.connected).remove(&identity);
            }
        }
    };
    let (peer, messages) = connection::spawn_ahmp(ws, remote.url(), remote.certificates, on_close);
    connected.insert(identity, peer.clone());
    lock(&shared.addresses).insert(identity, remote.address);
    drop(connected);

    info!("Connected to {}", peer.url());
    let _ = accept_tx.send(InboundPeer { peer, messages });
}

async fn dial(shared: Arc<Shared>, url: PeerUrl) {
    let result = async {
        let (mut ws, _) = connect_async(format!("ws://{}", url.address))
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", url.address, e)))?;
        let ours = HandshakeMessage::new(
            shared.identity.certificates(),
            &shared.url.address,
            ChannelRole::Ahmp,
        );
        let remote = connection::client_handshake(&mut ws, &ours).await?;
        if remote.identity != url.identity {
            return Err(TransportError::HandshakeFailed(format!(
                "{} answered as {}",
                url.address,
                remote.identity.short()
            )));
        }
        Ok::<_, TransportError>((ws, remote))
    }
    .await;

    match result {
        Ok((ws, remote)) => register(&shared, ws, remote),
        Err(e) => warn!("Failed to connect to {}: {}", url, e),
    }
    lock(&shared.dialing).remove(&url.identity);
}

#[async_trait]
impl PeerTransport for WsTransport {
    fn local_identity(&self) -> &LocalIdentity {
        &self.shared.identity
    }

    fn local_url(&self) -> PeerUrl {
        self.shared.url.clone()
    }

    async fn accept(&self) -> Option<InboundPeer> {
        self.accept_rx.lock().await.recv().await
    }

    fn connect(&self, url: &PeerUrl) {
        if url.identity == *self.shared.identity.hash()
            || lock(&self.shared.connected).contains_key(&url.identity)
        {
            return;
        }
        if !lock(&self.shared.dialing).insert(url.identity) {
            return;
        }
        debug!("Dialing {}", url);
        tokio::spawn(dial(self.shared.clone(), url.clone()));
    }

    async fn connect_content(&self, peer: &IdentityHash) -> Result<ContentSession> {
        let address = lock(&self.shared.addresses)
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::PeerNotFound(peer.to_string()))?;

        let (mut ws, _) = connect_async(format!("ws://{address}"))
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{address}: {e}")))?;
        let ours = HandshakeMessage::new(
            self.shared.identity.certificates(),
            &self.shared.url.address,
            ChannelRole::Content,
        );
        let remote = connection::client_handshake(&mut ws, &ours).await?;
        if remote.identity != *peer {
            return Err(TransportError::HandshakeFailed(format!(
                "{address} answered as {}",
                remote.identity.short()
            )));
        }
        Ok(connection::spawn_content(ws, *peer))
    }

    async fn accept_content(&self) -> Option<ContentSession> {
        self.content_rx.lock().await.recv().await
    }

    fn register_trusted(&self, certificates: PeerCertificates) {
        let identity = certificates.identity();
        debug!("Trusting certificates of {}", identity.short());
        lock(&self.shared.trusted).insert(identity, certificates);
    }

    async fn close(&self) {
        if let Some(task) = lock(&self.listener_task).take() {
            task.abort();
        }
        lock(&self.shared.accept_tx).take();
        lock(&self.shared.content_tx).take();

        let peers: Vec<Arc<WsPeer>> = lock(&self.shared.connected).drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.close();
        }
        info!("WebSocket transport closed");
    }
}
