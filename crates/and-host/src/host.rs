//! Host orchestrator.
//!
//! Bridges a `PeerTransport` to the engine and the engine's event stream to
//! application-facing `World`s:
//! - accept loop: one dispatch task per connected peer
//! - dispatch task: routes the peer's AHMP messages to the engine
//! - event loop: resolves pending opens/joins, feeds worlds, fulfils
//!   connect/timer/trust requests
//!
//! Worlds and pending joins are looked up by session id; nothing holds a
//! reference back to the host.

use crate::config::HostConfig;
use crate::error::HostError;
use crate::path_resolver::PathResolver;
use crate::world::{PeerRequest, World, WorldEvent, WorldPeer};
use and_core::protocol::DECLINE_NOT_FOUND;
use and_core::{
    AhmpMessage, AndError, AndPeer, AndResult, ContentSession, Engine, EngineEvent,
    IdentityHash, InboundPeer, PeerSession, PeerTransport, PeerUrl, SessionId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

type JoinOutcome = Result<World, HostError>;

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

struct HostInner {
    config: HostConfig,
    transport: Arc<dyn PeerTransport>,
    engine: Arc<Engine>,
    path_resolver: Arc<dyn PathResolver>,
    worlds: Mutex<HashMap<SessionId, mpsc::UnboundedSender<WorldEvent>>>,
    join_queue: Mutex<HashMap<SessionId, oneshot::Sender<JoinOutcome>>>,
    serving: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    errors_tx: mpsc::Sender<HostError>,
    errors_rx: Mutex<mpsc::Receiver<HostError>>,
    fault: Mutex<Option<String>>,
}

impl Host {
    pub fn new(
        config: HostConfig,
        transport: Arc<dyn PeerTransport>,
        path_resolver: Arc<dyn PathResolver>,
    ) -> Self {
        let engine = Arc::new(Engine::new(
            *transport.local_identity().hash(),
            config.engine.to_engine_config(),
        ));
        let (shutdown_tx, _) = watch::channel(false);
        let (errors_tx, errors_rx) = mpsc::channel(config.error_queue_capacity.max(1));

        Self {
            inner: Arc::new(HostInner {
                config,
                transport,
                engine,
                path_resolver,
                worlds: Mutex::new(HashMap::new()),
                join_queue: Mutex::new(HashMap::new()),
                serving: AtomicBool::new(false),
                shutdown_tx,
                errors_tx,
                errors_rx: Mutex::new(errors_rx),
                fault: Mutex::new(None),
            }),
        }
    }

    /// Run the accept and event loops until `shutdown` or a fatal fault.
    ///
    /// May be called once. Returns `HostError::Fatal` if the engine broke.
    pub async fn serve(&self) -> Result<(), HostError> {
        if self.inner.serving.swap(true, Ordering::AcqRel) {
            return Err(HostError::AlreadyServing);
        }
        let events = self
            .inner
            .engine
            .take_event_receiver()
            .ok_or(HostError::AlreadyServing)?;

        info!("Serving as {}", self.inner.transport.local_url());

        let (stop_tx, stop_rx) = oneshot::channel();
        let event_loop = tokio::spawn(event_loop(self.inner.clone(), events, stop_rx));
        let accept_loop = tokio::spawn(accept_loop(self.inner.clone()));

        // Dispatch tasks are drained inside the accept loop, so no engine
        // input is left once it returns.
        if let Err(e) = accept_loop.await {
            error!("Accept loop panicked: {}", e);
        }
        let _ = stop_tx.send(());
        if let Err(e) = event_loop.await {
            error!("Event loop panicked: {}", e);
        }

        self.inner.transport.close().await;
        self.inner.lock_join_queue().clear();
        self.inner.lock_worlds().clear();
        info!("Host stopped");

        match self.inner.fault() {
            Some(reason) => Err(HostError::Fatal(reason)),
            None => Ok(()),
        }
    }

    /// Ask `serve` to stop. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Open a new world at `text` with this node as its first member.
    pub async fn open_world(&self, text: &str) -> Result<World, HostError> {
        self.inner.ensure_running()?;
        let local = SessionId::generate();
        let rx = self.inner.enqueue_join(local);

        if let Err(e) = self.inner.engine.open_world(local, text) {
            self.inner.lock_join_queue().remove(&local);
            return Err(self.inner.escalate(e));
        }
        rx.await.map_err(|_| HostError::Shutdown)?
    }

    /// Join the world at `url`, giving up after `timeout` (or the configured default).
    pub async fn join_world(
        &self,
        url: &PeerUrl,
        timeout: Option<Duration>,
    ) -> Result<World, HostError> {
        self.inner.ensure_running()?;
        let local = SessionId::generate();
        let mut rx = self.inner.enqueue_join(local);

        if let Err(e) = self.inner.engine.join_world(local, url) {
            self.inner.lock_join_queue().remove(&local);
            return Err(self.inner.escalate(e));
        }

        let deadline = timeout.unwrap_or_else(|| self.inner.config.default_join_timeout());
        tokio::select! {
            outcome = &mut rx => return outcome.map_err(|_| HostError::Shutdown)?,
            _ = tokio::time::sleep(deadline) => {}
        }

        info!("Join {} timed out after {:?}, cancelling", local, deadline);
        if let Err(e) = self.inner.engine.cancel_join(local) {
            // Lost the race: the outcome is already on its way.
            if e.is_fatal() {
                return Err(self.inner.escalate(e));
            }
            debug!("cancel_join({}): {}", local, e);
        }
        rx.await.map_err(|_| HostError::Shutdown)?
    }

    /// Leave a world. Its event sequence ends with `Terminate`.
    pub fn leave_world(&self, world: &World) -> Result<(), HostError> {
        self.leave_session(world.session_id())
    }

    pub fn leave_session(&self, local: SessionId) -> Result<(), HostError> {
        self.inner
            .engine
            .close_world(local)
            .map_err(|e| self.inner.escalate(e))
    }

    /// Open a content channel to a connected peer.
    pub async fn content_channel(&self, peer: &IdentityHash) -> Result<ContentSession, HostError> {
        Ok(self.inner.transport.connect_content(peer).await?)
    }

    /// Next content channel a remote peer opened to us.
    pub async fn accept_content(&self) -> Option<ContentSession> {
        self.inner.transport.accept_content().await
    }

    pub fn local_url(&self) -> PeerUrl {
        self.inner.transport.local_url()
    }

    pub fn local_identity(&self) -> IdentityHash {
        *self.inner.engine.local_identity()
    }

    /// Connect to a peer without joining anything through it.
    pub fn open_outbound_connection(&self, url: &PeerUrl) {
        self.inner.transport.connect(url);
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    /// Oldest unread host error, if any.
    pub fn pop_error(&self) -> Option<HostError> {
        self.inner
            .errors_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .try_recv()
            .ok()
    }

    /// Queue an error for `pop_error`. Returns false if the queue is full.
    pub fn report(&self, err: HostError) -> bool {
        self.inner.report(err)
    }

    pub fn pending_join_count(&self) -> usize {
        self.inner.lock_join_queue().len()
    }

    pub fn world_count(&self) -> usize {
        self.inner.lock_worlds().len()
    }
}

impl HostInner {
    fn lock_worlds(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SessionId, mpsc::UnboundedSender<WorldEvent>>> {
        self.worlds.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_join_queue(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SessionId, oneshot::Sender<JoinOutcome>>> {
        self.join_queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fault(&self) -> Option<String> {
        self.fault.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn ensure_running(&self) -> Result<(), HostError> {
        if let Some(reason) = self.fault() {
            return Err(HostError::Fatal(reason));
        }
        if *self.shutdown_tx.borrow() {
            return Err(HostError::Shutdown);
        }
        Ok(())
    }

    fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Shutting down");
        }
    }

    fn enqueue_join(&self, local: SessionId) -> oneshot::Receiver<JoinOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock_join_queue().insert(local, tx);
        rx
    }

    fn resolve_join(&self, local: SessionId, outcome: JoinOutcome) -> Option<JoinOutcome> {
        let Some(tx) = self.lock_join_queue().remove(&local) else {
            return Some(outcome);
        };
        tx.send(outcome).err()
    }

    fn report(&self, err: HostError) -> bool {
        match self.errors_tx.try_send(err) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(err)) => {
                warn!("Error queue full, dropping: {}", err);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// The engine is corrupted: record it, surface it and stop serving.
    fn fatal(&self, reason: String) {
        {
            let mut fault = self.fault.lock().unwrap_or_else(|e| e.into_inner());
            if fault.is_some() {
                return;
            }
            *fault = Some(reason.clone());
        }
        error!("Fatal engine fault: {}", reason);
        self.report(HostError::Fatal(reason));
        self.shutdown();
    }

    /// Convert an engine error for a caller, stopping the host if it is fatal.
    fn escalate(&self, err: AndError) -> HostError {
        if let AndError::Corrupted(reason) = &err {
            self.fatal(reason.clone());
        }
        HostError::from(err)
    }

    /// Absorb the result of an engine call made on behalf of the network.
    fn absorb(&self, op: &str, result: AndResult) {
        match result {
            Ok(()) => {}
            Err(AndError::Invalid(reason)) => debug!("{} dropped: {}", op, reason),
            Err(AndError::Corrupted(reason)) => self.fatal(reason),
        }
    }

    fn send_to_world(&self, local: SessionId, event: WorldEvent) {
        let worlds = self.lock_worlds();
        match worlds.get(&local) {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("World {} is no longer read", local);
                }
            }
            None => debug!("Event for unknown world {}", local),
        }
    }

    // ==================== Dispatch ====================

    fn dispatch(&self, peer: &Arc<dyn AndPeer>, message: AhmpMessage) {
        let kind = message.kind();
        let session = |sid: SessionId| PeerSession::new(peer.clone(), sid);
        let result = match message {
            AhmpMessage::Jn { text, sender } => self.on_join_request(session(sender), &text),
            AhmpMessage::Jok {
                recver,
                sender,
                text,
                neighbors,
            } => self.engine.jok(recver, &session(sender), &text, &neighbors),
            // JDN carries no sender session
            AhmpMessage::Jdn { recver, code, text } => {
                self.engine.jdn(recver, &session(recver), code, &text)
            }
            AhmpMessage::Jni {
                recver,
                sender,
                neighbor,
            } => self.engine.jni(recver, &session(sender), &neighbor),
            AhmpMessage::Mem { recver, sender } => self.engine.mem(recver, &session(sender)),
            AhmpMessage::Snb {
                recver,
                sender,
                members,
            } => self.engine.snb(recver, &session(sender), &members),
            AhmpMessage::Crr {
                recver,
                sender,
                members,
            } => self.engine.crr(recver, &session(sender), &members),
            AhmpMessage::Rst { recver, sender } => self.engine.rst(recver, &session(sender)),
            AhmpMessage::Soa {
                recver,
                sender,
                objects,
            } => self.engine.soa(recver, &session(sender), objects),
            AhmpMessage::Sod {
                recver,
                sender,
                object_ids,
            } => self.engine.sod(recver, &session(sender), object_ids),
        };
        self.absorb(kind, result);
    }

    fn on_join_request(&self, peer: PeerSession, path: &str) -> AndResult {
        let local = self.path_resolver.resolve(path, peer.identity());
        match local {
            Some(local) if self.engine.is_open(local) => self.engine.jn(local, &peer),
            _ => {
                debug!(
                    "No world at {:?} for {}, declining",
                    path,
                    peer.identity().short()
                );
                self.engine
                    .reject_join(&peer, DECLINE_NOT_FOUND, &format!("no world at /{path}"))
            }
        }
    }

    // ==================== Events ====================

    fn on_event(self: &Arc<Self>, event: EngineEvent, timers: &mut JoinSet<()>) {
        match event {
            EngineEvent::JoinSuccess { local, text } => self.on_join_success(local, text),
            EngineEvent::JoinFail { local, code, text } => {
                let failure = Err(HostError::JoinFailed {
                    code,
                    message: text,
                });
                if self.resolve_join(local, failure).is_some() {
                    debug!("Join {} failed with nobody waiting", local);
                }
            }
            EngineEvent::WorldLeave { local } => {
                if let Some(tx) = self.lock_worlds().remove(&local) {
                    let _ = tx.send(WorldEvent::Terminate);
                }
            }
            EngineEvent::SessionRequest { local, peer } => {
                let request = PeerRequest::new(self.engine.clone(), local, peer);
                self.send_to_world(local, WorldEvent::PeerRequest(request));
            }
            EngineEvent::SessionReady { local, peer } => {
                let peer = WorldPeer::new(self.engine.clone(), local, peer);
                self.send_to_world(local, WorldEvent::PeerReady(peer));
            }
            EngineEvent::SessionClose { local, peer } => {
                let peer = WorldPeer::new(self.engine.clone(), local, peer);
                self.send_to_world(local, WorldEvent::PeerLeave(peer));
            }
            EngineEvent::ObjectAppend {
                local,
                peer,
                objects,
            } => self.send_to_world(local, WorldEvent::ObjectAppend { peer, objects }),
            EngineEvent::ObjectDelete {
                local,
                peer,
                object_ids,
            } => self.send_to_world(local, WorldEvent::ObjectDelete { peer, object_ids }),
            EngineEvent::ConnectRequest { url } => {
                debug!("Connecting to {}", url);
                self.transport.connect(&url);
            }
            EngineEvent::TimerRequest { local, after } => {
                let inner = self.clone();
                let mut shutdown = self.shutdown_tx.subscribe();
                timers.spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(after) => {
                            let result = inner.engine.timer_expire(local);
                            inner.absorb("timer_expire", result);
                        }
                        _ = shutdown_signal(&mut shutdown) => {}
                    }
                });
            }
            EngineEvent::PeerRegister { certificates } => {
                self.transport.register_trusted(certificates);
            }
            EngineEvent::NeighborDebug { text } => debug!("{}", text),
            EngineEvent::Fault { reason } => self.fatal(reason),
        }
    }

    fn on_join_success(&self, local: SessionId, text: String) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_worlds().insert(local, tx);
        let world = World::new(self.engine.clone(), local, text, rx);

        if self.resolve_join(local, Ok(world)).is_some() {
            debug!("World {} resolved with nobody waiting, leaving", local);
            let result = self.engine.close_world(local);
            self.absorb("close_world", result);
        }
    }
}

// ==================== Loops ====================

async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopping| *stopping).await;
}

async fn accept_loop(inner: Arc<HostInner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut peers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_signal(&mut shutdown) => break,
            inbound = inner.transport.accept() => match inbound {
                Some(inbound) => {
                    peers.spawn(dispatch_loop(inner.clone(), inbound));
                }
                None => {
                    debug!("Transport stopped accepting");
                    break;
                }
            },
            Some(finished) = peers.join_next(), if !peers.is_empty() => {
                if let Err(e) = finished {
                    warn!("Dispatch task failed: {}", e);
                }
            }
        }
    }

    while let Some(finished) = peers.join_next().await {
        if let Err(e) = finished {
            warn!("Dispatch task failed: {}", e);
        }
    }
}

async fn dispatch_loop(inner: Arc<HostInner>, inbound: InboundPeer) {
    let InboundPeer { peer, mut messages } = inbound;
    let identity = *peer.identity();

    if let Err(e) = inner.engine.peer_connected(peer.clone()) {
        match e {
            AndError::Invalid(reason) => info!("Rejected peer {}: {}", identity.short(), reason),
            AndError::Corrupted(reason) => inner.fatal(reason),
        }
        return;
    }
    info!("Peer connected: {}", identity.short());

    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(message) => {
                    debug!("{} from {}", message.kind(), identity.short());
                    inner.dispatch(&peer, message);
                }
                None => break,
            },
            _ = shutdown_signal(&mut shutdown) => break,
        }
    }

    info!("Peer disconnected: {}", identity.short());
    let result = inner.engine.peer_disconnected(&identity);
    inner.absorb("peer_disconnected", result);
}

async fn event_loop(
    inner: Arc<HostInner>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut timers = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => inner.on_event(event, &mut timers),
                None => break,
            },
            _ = &mut stop => {
                while let Ok(event) = events.try_recv() {
                    inner.on_event(event, &mut timers);
                }
                break;
            }
            Some(_) = timers.join_next(), if !timers.is_empty() => {}
        }
    }

    timers.abort_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_resolver::SimplePathResolver;
    use and_core::MemoryNetwork;

    fn host(net: &MemoryNetwork, name: &str) -> Host {
        Host::new(
            HostConfig::default(),
            net.transport(name),
            Arc::new(SimplePathResolver::new()),
        )
    }

    #[tokio::test]
    async fn test_serve_twice_is_rejected() {
        let net = MemoryNetwork::new();
        let a = host(&net, "a");

        let running = tokio::spawn({
            let a = a.clone();
            async move { a.serve().await }
        });
        tokio::task::yield_now().await;
        while !a.inner.serving.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }

        assert!(matches!(a.serve().await, Err(HostError::AlreadyServing)));

        a.shutdown();
        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let net = MemoryNetwork::new();
        let a = host(&net, "a");
        a.shutdown();

        assert!(matches!(a.open_world("lobby").await, Err(HostError::Shutdown)));
        assert!(a.serve().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_failure_leaves_no_queue_entry() {
        let net = MemoryNetwork::new();
        let a = host(&net, "a");

        let result = a.open_world("   ").await;
        assert!(matches!(result, Err(HostError::InvalidArgument(_))));
        assert_eq!(a.pending_join_count(), 0);
    }

    #[tokio::test]
    async fn test_join_through_self_is_invalid() {
        let net = MemoryNetwork::new();
        let a = host(&net, "a");

        let result = a.join_world(&a.local_url().with_path("lobby"), None).await;
        assert!(matches!(result, Err(HostError::InvalidArgument(_))));
        assert_eq!(a.pending_join_count(), 0);
    }

    #[test]
    fn test_error_queue_is_bounded() {
        let net = MemoryNetwork::new();
        let config = HostConfig {
            error_queue_capacity: 2,
            ..HostConfig::default()
        };
        let a = Host::new(
            config,
            net.transport("a"),
            Arc::new(SimplePathResolver::new()),
        );

        assert!(a.report(HostError::Shutdown));
        assert!(a.report(HostError::AlreadyServing));
        assert!(!a.report(HostError::Fatal("late".into())));

        assert!(matches!(a.pop_error(), Some(HostError::Shutdown)));
        assert!(matches!(a.pop_error(), Some(HostError::AlreadyServing)));
        assert!(a.pop_error().is_none());
    }
}
