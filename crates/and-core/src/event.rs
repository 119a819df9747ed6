//! Events the engine emits toward its host.
//!
//! The engine never performs I/O beyond non-blocking sends to already
//! connected peers; everything else (connecting, timers, world bookkeeping)
//! is requested through these events and carried out by the host.

use crate::identity::PeerCertificates;
use crate::ids::{IdentityHash, ObjectId, SessionId};
use crate::protocol::ObjectInfo;
use crate::transport::AndPeer;
use crate::url::PeerUrl;
use std::sync::Arc;
use std::time::Duration;

/// A remote peer's session in one of our worlds.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub peer: Arc<dyn AndPeer>,
    pub session_id: SessionId,
}

impl PeerSession {
    pub fn new(peer: Arc<dyn AndPeer>, session_id: SessionId) -> Self {
        Self { peer, session_id }
    }

    pub fn identity(&self) -> &IdentityHash {
        self.peer.identity()
    }
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A peer asked to join world `local`; the application must accept or decline.
    SessionRequest { local: SessionId, peer: PeerSession },
    /// A peer session became established.
    SessionReady { local: SessionId, peer: PeerSession },
    /// An established peer session ended.
    SessionClose { local: SessionId, peer: PeerSession },
    /// An open or join resolved successfully.
    JoinSuccess { local: SessionId, text: String },
    /// A join resolved unsuccessfully.
    JoinFail {
        local: SessionId,
        code: i32,
        text: String,
    },
    /// World `local` was closed locally.
    WorldLeave { local: SessionId },
    /// Please connect to this peer.
    ConnectRequest { url: PeerUrl },
    /// Call `timer_expire(local)` after `after`.
    TimerRequest { local: SessionId, after: Duration },
    /// Remember these certificates; a connection to their owner is expected.
    PeerRegister { certificates: PeerCertificates },
    ObjectAppend {
        local: SessionId,
        peer: IdentityHash,
        objects: Vec<ObjectInfo>,
    },
    ObjectDelete {
        local: SessionId,
        peer: IdentityHash,
        object_ids: Vec<ObjectId>,
    },
    /// Free-form diagnostics about membership decisions.
    NeighborDebug { text: String },
    /// An invariant broke; the engine refuses further mutations.
    Fault { reason: String },
}

impl EngineEvent {
    /// The local world the event belongs to, if any.
    pub fn local_session(&self) -> Option<SessionId> {
        match self {
            Self::SessionRequest { local, .. }
            | Self::SessionReady { local, .. }
            | Self::SessionClose { local, .. }
            | Self::JoinSuccess { local, .. }
            | Self::JoinFail { local, .. }
            | Self::WorldLeave { local }
            | Self::TimerRequest { local, .. }
            | Self::ObjectAppend { local, .. }
            | Self::ObjectDelete { local, .. } => Some(*local),
            Self::ConnectRequest { .. }
            | Self::PeerRegister { .. }
            | Self::NeighborDebug { .. }
            | Self::Fault { .. } => None,
        }
    }
}
