//! WebSocket channel setup and pumps.
//!
//! A channel is handshaken first (`client_handshake` / `server_handshake`),
//! then split into a read task and a write task. AHMP channels surface as a
//! `WsPeer` plus a stream of decoded messages; content channels as a
//! `ContentSession`.

use crate::message::{ChannelRole, HandshakeMessage, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use and_core::transport::Result;
use and_core::{
    AhmpMessage, AndPeer, ContentSession, IdentityHash, PeerCertificates, PeerUrl,
    TransportError,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ==================== Handshake ====================

/// Connecting side: send our handshake, then verify the answer.
pub async fn client_handshake<S>(
    ws: &mut WebSocketStream<S>,
    ours: &HandshakeMessage,
) -> Result<HandshakeMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        send_handshake(ws, ours).await?;
        let remote = recv_handshake(ws).await?;
        verify(&remote, ours.role)?;
        Ok::<_, TransportError>(remote)
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| TransportError::HandshakeFailed("timed out".to_string()))?
}

/// Accepting side: read the remote handshake and answer for the same role.
pub async fn server_handshake<S>(
    ws: &mut WebSocketStream<S>,
    certificates: &PeerCertificates,
    address: &str,
) -> Result<HandshakeMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let remote = recv_handshake(ws).await?;
        verify(&remote, remote.role)?;
        let ours = HandshakeMessage::new(certificates, address, remote.role);
        send_handshake(ws, &ours).await?;
        Ok::<_, TransportError>(remote)
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| TransportError::HandshakeFailed("timed out".to_string()))?
}

async fn send_handshake<S>(ws: &mut WebSocketStream<S>, handshake: &HandshakeMessage) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(Message::Binary(handshake.to_binary().into()))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

async fn recv_handshake<S>(ws: &mut WebSocketStream<S>) -> Result<HandshakeMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let data = match ws.next().await {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::HandshakeFailed(
                    "closed during handshake".to_string(),
                ));
            }
            Some(Err(e)) => return Err(TransportError::HandshakeFailed(e.to_string())),
        };
        return HandshakeMessage::from_binary(&data).ok_or_else(|| {
            TransportError::HandshakeFailed("expected a handshake frame".to_string())
        });
    }
}

fn verify(remote: &HandshakeMessage, role: ChannelRole) -> Result<()> {
    if remote.version != PROTOCOL_VERSION {
        return Err(TransportError::HandshakeFailed(format!(
            "unsupported protocol version {}",
            remote.version
        )));
    }
    if !remote.is_authentic() {
        return Err(TransportError::HandshakeFailed(format!(
            "identity {} does not match its certificate",
            remote.identity.short()
        )));
    }
    if remote.role != role {
        return Err(TransportError::HandshakeFailed(format!(
            "expected a {:?} channel, got {:?}",
            role, remote.role
        )));
    }
    Ok(())
}

// ==================== Peers ====================

/// AHMP side of a WebSocket connection.
#[derive(Debug)]
pub struct WsPeer {
    url: PeerUrl,
    certificates: PeerCertificates,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl WsPeer {
    /// Stop writing. The write task sends a close frame and the connection winds down.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl AndPeer for WsPeer {
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
        let Some(tx) = tx.as_ref() else {
            return Err(TransportError::Closed);
        };
        tx.send(message.to_json())
            .map_err(|_| TransportError::SendFailed(format!("{} is gone", self.url.identity.short())))
    }
}

/// Start pumping an AHMP channel. `on_close` runs once the connection is gone.
pub fn spawn_ahmp<S, F>(
    ws: WebSocketStream<S>,
    url: PeerUrl,
    certificates: PeerCertificates,
    on_close: F,
) -> (Arc<WsPeer>, mpsc::UnboundedReceiver<AhmpMessage>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let (write, read) = ws.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let label = url.identity.short();

    let writer = tokio::spawn(write_loop(label.clone(), write, out_rx));
    tokio::spawn(async move {
        read_loop(&label, read, |data| match AhmpMessage::from_json(&data) {
            Some(message) => in_tx.send(message).is_ok(),
            None => {
                warn!("Undecodable message from {} ({} bytes), dropping", label, data.len());
                true
            }
        })
        .await;
        writer.abort();
        on_close();
    });

    let peer = Arc::new(WsPeer {
        url,
        certificates,
        tx: Mutex::new(Some(out_tx)),
    });
    (peer, in_rx)
}

/// Start pumping a content channel to `peer`.
pub fn spawn_content<S>(ws: WebSocketStream<S>, peer: IdentityHash) -> ContentSession
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write, read) = ws.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let label = format!("{} (content)", peer.short());

    let writer = tokio::spawn(write_loop(label.clone(), write, out_rx));
    tokio::spawn(async move {
        read_loop(&label, read, |data| in_tx.send(data).is_ok()).await;
        writer.abort();
    });

    ContentSession::new(peer, out_tx, in_rx)
}

/// Forward frames to `deliver` until the connection ends or `deliver` returns false.
async fn read_loop<S, F>(label: &str, mut read: SplitStream<WebSocketStream<S>>, mut deliver: F)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(Vec<u8>) -> bool,
{
    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                let data = match msg {
                    Message::Binary(data) => data,
                    Message::Text(text) => text.into_bytes(),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame from {}", label);
                        break;
                    }
                    Message::Frame(_) => continue,
                };

                if data.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds max size ({} > {}), dropping",
                        label,
                        data.len(),
                        MAX_MESSAGE_SIZE
                    );
                    continue;
                }
                if !deliver(data) {
                    debug!("Reader for {} went away", label);
                    break;
                }
            }
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Connection {} closed", label);
                    }
                    _ => {
                        error!("WebSocket error on {}: {}", label, e);
                    }
                }
                break;
            }
            None => {
                debug!("Connection {} stream ended", label);
                break;
            }
        }
    }
}

async fn write_loop<S>(
    label: String,
    mut write: SplitSink<WebSocketStream<S>, Message>,
    mut out: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(data) = out.recv().await {
        if let Err(e) = write.send(Message::Binary(data.into())).await {
            debug!("Failed to send to {}: {}", label, e);
            return;
        }
    }
    let _ = write.send(Message::Close(None)).await;
}
