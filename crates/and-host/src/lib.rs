//! and-host: runs an and-core engine against a real transport.
//!
//! Provides the host orchestrator and the `World` handles it gives to
//! applications, a WebSocket `PeerTransport`, path resolution for inbound
//! joins, and a handle-based embedding surface.

pub mod config;
pub mod connection;
pub mod embed;
pub mod error;
pub mod host;
pub mod message;
pub mod path_resolver;
pub mod server;
pub mod world;

// Re-export key types for convenience
pub use config::{EngineSettings, HostConfig};
pub use embed::{EmbedError, EmbedEvent, Embedding, ErrorDescriptor, ErrorQueue, HandleRegistry};
pub use error::{HostError, WorldError};
pub use host::Host;
pub use message::{ChannelRole, HandshakeMessage, MAX_MESSAGE_SIZE};
pub use path_resolver::{PathResolver, SimplePathResolver};
pub use server::WsTransport;
pub use world::{PeerRequest, World, WorldEvent, WorldPeer};
