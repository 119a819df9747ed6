//! and-core: neighbor discovery for peer-to-peer world sessions.
//!
//! This crate provides:
//! - The AHMP membership protocol messages
//! - The engine that tracks world sessions and their members
//! - Peer identities and `and://` peer URLs
//! - The `PeerTransport` abstraction, with an in-memory implementation

pub mod engine;
pub mod error;
pub mod event;
pub mod identity;
pub mod ids;
pub mod protocol;
pub mod transport;
pub mod url;

pub use engine::{Engine, EngineConfig, JoinState, MemberSummary, SanityError};
pub use error::{AndError, AndResult, ResultCode};
pub use event::{EngineEvent, PeerSession};
pub use identity::{LocalIdentity, PeerCertificates};
pub use ids::{IdError, IdentityHash, ObjectId, SessionId};
pub use protocol::{AhmpMessage, ObjectInfo, PeerSessionInfo};
pub use transport::{
    AndPeer, ContentSession, InboundPeer, MemoryNetwork, MemoryTransport, PeerTransport,
    TransportError,
};
pub use url::{PeerUrl, UrlError};
