//! Handle-based surface for embedding a node in a foreign host process.
//!
//! Every object crosses the boundary as an integer handle. Lookups check the
//! handle's type, so a stale or wrongly-typed handle is reported as
//! `EmbedError::InvalidHandle` instead of misbehaving. Failed calls also leave
//! an `ErrorDescriptor` in a bounded queue the embedder drains at its own pace.

use crate::config::HostConfig;
use crate::error::{HostError, WorldError};
use crate::host::Host;
use crate::path_resolver::{PathResolver, SimplePathResolver};
use crate::world::{PeerRequest, World, WorldEvent, WorldPeer};
use and_core::{IdentityHash, ObjectId, ObjectInfo, PeerTransport, PeerUrl, ResultCode, SessionId, UrlError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub type Handle = u64;

/// Error code reported for unknown or wrongly-typed handles.
pub const INVALID_HANDLE: i32 = -99;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Invalid handle: {0}")]
    InvalidHandle(Handle),

    #[error("Buffer too small, {needed} bytes needed")]
    BufferTooSmall { needed: usize },

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    World(#[from] WorldError),

    #[error("Invalid URL: {0}")]
    Url(#[from] UrlError),
}

impl EmbedError {
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidHandle(_) => INVALID_HANDLE,
            Self::Host(HostError::JoinFailed { code, .. }) => *code,
            Self::Host(HostError::Fatal(_)) => ResultCode::Corrupted as i32,
            Self::World(WorldError::Engine(e)) => e.code() as i32,
            _ => ResultCode::Invalid as i32,
        }
    }
}

// ==================== Error queue ====================

/// A failed call, as the embedder sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescriptor {
    pub code: i32,
    message: String,
}

impl ErrorDescriptor {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Byte length of the UTF-8 message.
    pub fn len(&self) -> usize {
        self.message.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
    }

    /// Copy the message into `buf`, returning the number of bytes written.
    pub fn copy_to(&self, buf: &mut [u8]) -> Result<usize, EmbedError> {
        let bytes = self.message.as_bytes();
        if buf.len() < bytes.len() {
            return Err(EmbedError::BufferTooSmall {
                needed: bytes.len(),
            });
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }
}

impl From<&EmbedError> for ErrorDescriptor {
    fn from(e: &EmbedError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

/// Bounded FIFO of error descriptors. A full queue rejects new entries.
#[derive(Debug)]
pub struct ErrorQueue {
    capacity: usize,
    items: Mutex<VecDeque<ErrorDescriptor>>,
}

impl ErrorQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Returns false if the queue was full.
    pub fn push(&self, descriptor: ErrorDescriptor) -> bool {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.len() >= self.capacity {
            warn!("Error queue full, dropping: {}", descriptor.message);
            return false;
        }
        items.push_back(descriptor);
        true
    }

    pub fn pop(&self) -> Option<ErrorDescriptor> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ==================== Handle registry ====================

/// Objects that can sit behind a handle.
pub enum HandleObject {
    Host(Host),
    Resolver(Arc<SimplePathResolver>),
    World {
        host: Host,
        session_id: SessionId,
        world: Arc<tokio::sync::Mutex<World>>,
    },
    PeerRequest(PeerRequest),
    WorldPeer(WorldPeer),
}

impl HandleObject {
    fn kind(&self) -> &'static str {
        match self {
            Self::Host(_) => "host",
            Self::Resolver(_) => "resolver",
            Self::World { .. } => "world",
            Self::PeerRequest(_) => "peer request",
            Self::WorldPeer(_) => "world peer",
        }
    }
}

#[derive(Default)]
pub struct HandleRegistry {
    next: AtomicU64,
    objects: Mutex<HashMap<Handle, HandleObject>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: HandleObject) -> Handle {
        // Handle 0 is never issued.
        let handle = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Handle {} -> {}", handle, object.kind());
        self.lock().insert(handle, object);
        handle
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.lock().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn host(&self, handle: Handle) -> Result<Host, EmbedError> {
        match self.lock().get(&handle) {
            Some(HandleObject::Host(host)) => Ok(host.clone()),
            _ => Err(EmbedError::InvalidHandle(handle)),
        }
    }

    pub fn resolver(&self, handle: Handle) -> Result<Arc<SimplePathResolver>, EmbedError> {
        match self.lock().get(&handle) {
            Some(HandleObject::Resolver(resolver)) => Ok(resolver.clone()),
            _ => Err(EmbedError::InvalidHandle(handle)),
        }
    }

    pub fn world(
        &self,
        handle: Handle,
    ) -> Result<(SessionId, Arc<tokio::sync::Mutex<World>>), EmbedError> {
        match self.lock().get(&handle) {
            Some(HandleObject::World {
                session_id, world, ..
            }) => Ok((*session_id, world.clone())),
            _ => Err(EmbedError::InvalidHandle(handle)),
        }
    }

    pub fn peer_request(&self, handle: Handle) -> Result<PeerRequest, EmbedError> {
        match self.lock().get(&handle) {
            Some(HandleObject::PeerRequest(request)) => Ok(request.clone()),
            _ => Err(EmbedError::InvalidHandle(handle)),
        }
    }

    pub fn world_peer(&self, handle: Handle) -> Result<WorldPeer, EmbedError> {
        match self.lock().get(&handle) {
            Some(HandleObject::WorldPeer(peer)) => Ok(peer.clone()),
            _ => Err(EmbedError::InvalidHandle(handle)),
        }
    }

    /// Remove a handle, tearing down what it refers to.
    ///
    /// Closing a host shuts it down; closing a world leaves it.
    pub fn close(&self, handle: Handle) -> Result<(), EmbedError> {
        let object = self
            .lock()
            .remove(&handle)
            .ok_or(EmbedError::InvalidHandle(handle))?;

        match object {
            HandleObject::Host(host) => host.shutdown(),
            HandleObject::World {
                host, session_id, ..
            } => match host.leave_session(session_id) {
                Ok(()) | Err(HostError::InvalidArgument(_)) => {}
                Err(e) => return Err(e.into()),
            },
            HandleObject::Resolver(_) | HandleObject::PeerRequest(_) | HandleObject::WorldPeer(_) => {}
        }
        debug!("Closed handle {}", handle);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Handle, HandleObject>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ==================== Entry points ====================

/// World events with their objects replaced by handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedEvent {
    PeerRequest { request: Handle, peer: IdentityHash },
    PeerReady { peer: Handle, identity: IdentityHash },
    ObjectAppend { peer: IdentityHash, objects: Vec<ObjectInfo> },
    ObjectDelete { peer: IdentityHash, object_ids: Vec<ObjectId> },
    PeerLeave { identity: IdentityHash },
    Terminate,
}

/// Registry plus error queue: the whole embedding boundary.
pub struct Embedding {
    registry: HandleRegistry,
    errors: ErrorQueue,
}

impl Embedding {
    pub fn new(error_capacity: usize) -> Self {
        Self {
            registry: HandleRegistry::new(),
            errors: ErrorQueue::new(error_capacity),
        }
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    /// Oldest pending error.
    pub fn pop_error(&self) -> Option<ErrorDescriptor> {
        self.errors.pop()
    }

    pub fn pending_errors(&self) -> usize {
        self.errors.len()
    }

    pub fn new_resolver(&self) -> Handle {
        self.registry
            .insert(HandleObject::Resolver(Arc::new(SimplePathResolver::new())))
    }

    /// Serve the world behind `world` at `path`.
    pub fn set_mapping(&self, resolver: Handle, path: &str, world: Handle) -> Result<(), EmbedError> {
        self.track(|| {
            let resolver = self.registry.resolver(resolver)?;
            let (session_id, _) = self.registry.world(world)?;
            resolver.set_mapping(path, session_id);
            Ok(())
        })
    }

    pub fn delete_mapping(&self, resolver: Handle, path: &str) -> Result<(), EmbedError> {
        self.track(|| {
            self.registry.resolver(resolver)?.delete_mapping(path);
            Ok(())
        })
    }

    /// Create a host. The resolver handle must be valid; there is no fallback.
    pub fn new_host(
        &self,
        config: HostConfig,
        transport: Arc<dyn PeerTransport>,
        resolver: Handle,
    ) -> Result<Handle, EmbedError> {
        self.track(|| {
            let resolver: Arc<dyn PathResolver> = self.registry.resolver(resolver)?;
            let host = Host::new(config, transport, resolver);
            Ok(self.registry.insert(HandleObject::Host(host)))
        })
    }

    /// Start serving in the background.
    pub fn serve(&self, host: Handle) -> Result<(), EmbedError> {
        self.track(|| {
            let host = self.registry.host(host)?;
            tokio::spawn(async move {
                if let Err(e) = host.serve().await {
                    warn!("Host stopped: {}", e);
                    host.report(e);
                }
            });
            Ok(())
        })
    }

    pub async fn open_world(&self, host: Handle, text: &str) -> Result<Handle, EmbedError> {
        let result = async {
            let host = self.registry.host(host)?;
            let world = host.open_world(text).await?;
            Ok::<_, EmbedError>(self.insert_world(host, world))
        }
        .await;
        self.record(result)
    }

    pub async fn join_world(
        &self,
        host: Handle,
        url: &str,
        timeout_ms: Option<u64>,
    ) -> Result<Handle, EmbedError> {
        let result = async {
            let host = self.registry.host(host)?;
            let url: PeerUrl = url.parse()?;
            let world = host
                .join_world(&url, timeout_ms.map(Duration::from_millis))
                .await?;
            Ok::<_, EmbedError>(self.insert_world(host, world))
        }
        .await;
        self.record(result)
    }

    /// Next event of a world, waiting if needed. `None` once it has terminated.
    pub async fn next_event(&self, world: Handle) -> Result<Option<EmbedEvent>, EmbedError> {
        let result = async {
            let (_, world) = self.registry.world(world)?;
            let event = world.lock().await.next_event().await;
            Ok::<_, EmbedError>(event.map(|e| self.to_embed_event(e)))
        }
        .await;
        self.record(result)
    }

    pub fn accept(&self, request: Handle) -> Result<(), EmbedError> {
        self.track(|| {
            self.registry.peer_request(request)?.accept()?;
            Ok(())
        })
    }

    pub fn decline(&self, request: Handle, code: i32, message: &str) -> Result<(), EmbedError> {
        self.track(|| {
            self.registry.peer_request(request)?.decline(code, message)?;
            Ok(())
        })
    }

    pub fn append_objects(&self, peer: Handle, objects: Vec<ObjectInfo>) -> Result<(), EmbedError> {
        self.track(|| {
            self.registry.world_peer(peer)?.append_objects(objects)?;
            Ok(())
        })
    }

    pub fn delete_objects(&self, peer: Handle, object_ids: Vec<ObjectId>) -> Result<(), EmbedError> {
        self.track(|| {
            self.registry.world_peer(peer)?.delete_objects(object_ids)?;
            Ok(())
        })
    }

    pub fn close(&self, handle: Handle) -> Result<(), EmbedError> {
        self.track(|| self.registry.close(handle))
    }

    fn insert_world(&self, host: Host, world: World) -> Handle {
        let session_id = world.session_id();
        self.registry.insert(HandleObject::World {
            host,
            session_id,
            world: Arc::new(tokio::sync::Mutex::new(world)),
        })
    }

    fn to_embed_event(&self, event: WorldEvent) -> EmbedEvent {
        match event {
            WorldEvent::PeerRequest(request) => {
                let peer = *request.identity();
                EmbedEvent::PeerRequest {
                    request: self.registry.insert(HandleObject::PeerRequest(request)),
                    peer,
                }
            }
            WorldEvent::PeerReady(peer) => {
                let identity = *peer.identity();
                EmbedEvent::PeerReady {
                    peer: self.registry.insert(HandleObject::WorldPeer(peer)),
                    identity,
                }
            }
            WorldEvent::ObjectAppend { peer, objects } => EmbedEvent::ObjectAppend { peer, objects },
            WorldEvent::ObjectDelete { peer, object_ids } => {
                EmbedEvent::ObjectDelete { peer, object_ids }
            }
            WorldEvent::PeerLeave(peer) => EmbedEvent::PeerLeave {
                identity: *peer.identity(),
            },
            WorldEvent::Terminate => EmbedEvent::Terminate,
        }
    }

    fn track<T>(&self, f: impl FnOnce() -> Result<T, EmbedError>) -> Result<T, EmbedError> {
        self.record(f())
    }

    fn record<T>(&self, result: Result<T, EmbedError>) -> Result<T, EmbedError> {
        if let Err(e) = &result {
            self.errors.push(ErrorDescriptor::from(e));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use and_core::MemoryNetwork;

    // ==================== Error descriptors ====================

    #[test]
    fn test_descriptor_copy() {
        let descriptor = ErrorDescriptor::new(22, "bad input");
        assert_eq!(descriptor.len(), 9);

        let mut buf = [0u8; 16];
        assert_eq!(descriptor.copy_to(&mut buf).unwrap(), 9);
        assert_eq!(&buf[..9], b"bad input");

        let mut small = [0u8; 4];
        assert!(matches!(
            descriptor.copy_to(&mut small),
            Err(EmbedError::BufferTooSmall { needed: 9 })
        ));
    }

    #[test]
    fn test_error_queue_rejects_when_full() {
        let queue = ErrorQueue::new(2);
        assert!(queue.push(ErrorDescriptor::new(1, "one")));
        assert!(queue.push(ErrorDescriptor::new(2, "two")));
        assert!(!queue.push(ErrorDescriptor::new(3, "three")));

        assert_eq!(queue.pop().unwrap().code, 1);
        assert_eq!(queue.pop().unwrap().code, 2);
        assert!(queue.pop().is_none());
    }

    // ==================== Registry ====================

    #[test]
    fn test_typed_lookup_rejects_wrong_kind() {
        let embedding = Embedding::new(8);
        let resolver = embedding.new_resolver();

        assert!(embedding.registry().resolver(resolver).is_ok());
        assert!(matches!(
            embedding.registry().host(resolver),
            Err(EmbedError::InvalidHandle(h)) if h == resolver
        ));
        assert!(matches!(
            embedding.registry().world(12345),
            Err(EmbedError::InvalidHandle(12345))
        ));
    }

    #[test]
    fn test_close_removes_handle() {
        let embedding = Embedding::new(8);
        let resolver = embedding.new_resolver();

        embedding.close(resolver).unwrap();
        assert!(!embedding.registry().contains(resolver));
        assert!(embedding.close(resolver).is_err());

        let error = embedding.pop_error().unwrap();
        assert_eq!(error.code, INVALID_HANDLE);
    }

    #[test]
    fn test_new_host_requires_resolver_handle() {
        let embedding = Embedding::new(8);
        let net = MemoryNetwork::new();

        let result = embedding.new_host(HostConfig::default(), net.transport("a"), 777);
        assert!(matches!(result, Err(EmbedError::InvalidHandle(777))));
        assert_eq!(embedding.pending_errors(), 1);
        assert!(embedding.registry().is_empty());

        let resolver = embedding.new_resolver();
        let host = embedding
            .new_host(HostConfig::default(), net.transport("b"), resolver)
            .unwrap();
        assert!(embedding.registry().host(host).is_ok());
    }

    #[tokio::test]
    async fn test_open_and_close_world_handle() {
        let embedding = Embedding::new(8);
        let net = MemoryNetwork::new();
        let resolver = embedding.new_resolver();
        let host = embedding
            .new_host(HostConfig::default(), net.transport("a"), resolver)
            .unwrap();
        embedding.serve(host).unwrap();

        let world = embedding.open_world(host, "lobby").await.unwrap();
        embedding.set_mapping(resolver, "/lobby", world).unwrap();
        let (session_id, _) = embedding.registry().world(world).unwrap();
        let requester = IdentityHash::of_certificate(b"x");
        let resolved = embedding
            .registry()
            .resolver(resolver)
            .unwrap()
            .resolve("lobby", &requester);
        assert_eq!(resolved, Some(session_id));

        embedding.close(world).unwrap();
        let host_ref = embedding.registry().host(host).unwrap();
        assert!(!host_ref.engine().is_open(session_id));

        embedding.close(host).unwrap();
        assert_eq!(embedding.pending_errors(), 0);
    }
}
