//! AHMP: the membership protocol spoken between peers.
//!
//! Every message names the receiving peer's local session id (`recver`) so
//! the receiver can route it to the right world, except `Jn`, which is routed
//! by world path instead. All messages are JSON.

use crate::identity::PeerCertificates;
use crate::ids::{IdentityHash, ObjectId, SessionId};
use crate::url::PeerUrl;
use serde::{Deserialize, Serialize};

/// Declined because the requested world path resolves to nothing.
pub const DECLINE_NOT_FOUND: i32 = 404;
/// Default decline code used when the application gives none.
pub const DECLINE_DEFAULT: i32 = 403;
/// The joining side cancelled its own join.
pub const JOIN_CANCELLED: i32 = 499;
/// The join exhausted its retries without a response.
pub const JOIN_TIMEOUT: i32 = 408;
/// The peer we were joining through went away.
pub const JOIN_PEER_LOST: i32 = 410;

/// How to reach a member of a world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerSessionInfo {
    pub url: PeerUrl,
    pub session_id: SessionId,
    pub certificates: PeerCertificates,
}

impl PeerSessionInfo {
    pub fn identity(&self) -> IdentityHash {
        self.url.identity
    }
}

/// An object announced into a world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectInfo {
    pub id: ObjectId,
    /// Where the object's content can be fetched.
    pub address: String,
}

impl ObjectInfo {
    pub fn new(id: ObjectId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AhmpMessage {
    /// Join request for the world at path `text`.
    Jn { text: String, sender: SessionId },

    /// Join accepted. `neighbors` are the acceptor's established members.
    Jok {
        recver: SessionId,
        sender: SessionId,
        text: String,
        neighbors: Vec<PeerSessionInfo>,
    },

    /// Join declined.
    Jdn {
        recver: SessionId,
        code: i32,
        text: String,
    },

    /// A new member joined; the receiver should bootstrap a session with it.
    Jni {
        recver: SessionId,
        sender: SessionId,
        neighbor: PeerSessionInfo,
    },

    /// Membership probe, also used as liveness heartbeat.
    Mem { recver: SessionId, sender: SessionId },

    /// Snapshot of the sender's established members.
    Snb {
        recver: SessionId,
        sender: SessionId,
        members: Vec<PeerSessionInfo>,
    },

    /// Consistency repair request: the sender's view disagrees with ours.
    Crr {
        recver: SessionId,
        sender: SessionId,
        members: Vec<PeerSessionInfo>,
    },

    /// Drop the peer session between sender and receiver.
    Rst { recver: SessionId, sender: SessionId },

    /// Objects appended by the sender.
    Soa {
        recver: SessionId,
        sender: SessionId,
        objects: Vec<ObjectInfo>,
    },

    /// Objects deleted by the sender.
    Sod {
        recver: SessionId,
        sender: SessionId,
        object_ids: Vec<ObjectId>,
    },
}

impl AhmpMessage {
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("AhmpMessage serialization should not fail")
    }

    pub fn from_json(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    /// Short wire name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Jn { .. } => "JN",
            Self::Jok { .. } => "JOK",
            Self::Jdn { .. } => "JDN",
            Self::Jni { .. } => "JNI",
            Self::Mem { .. } => "MEM",
            Self::Snb { .. } => "SNB",
            Self::Crr { .. } => "CRR",
            Self::Rst { .. } => "RST",
            Self::Soa { .. } => "SOA",
            Self::Sod { .. } => "SOD",
        }
    }

    /// Local session the message is addressed to. `None` for `Jn`.
    pub fn recver(&self) -> Option<SessionId> {
        match self {
            Self::Jn { .. } => None,
            Self::Jok { recver, .. }
            | Self::Jdn { recver, .. }
            | Self::Jni { recver, .. }
            | Self::Mem { recver, .. }
            | Self::Snb { recver, .. }
            | Self::Crr { recver, .. }
            | Self::Rst { recver, .. }
            | Self::Soa { recver, .. }
            | Self::Sod { recver, .. } => Some(*recver),
        }
    }
}
