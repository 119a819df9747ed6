//! The neighbor discovery engine.
//!
//! One `Engine` per node. It owns every world session and its member table
//! behind a single lock, consumes AHMP messages and local requests, and
//! reports everything else through `EngineEvent`s.
//!
//! Every mutating call is checked against the structural invariants
//! afterwards (see `sanity`). A breach poisons the engine: a `Fault` event is
//! emitted once and all later mutations fail with `AndError::Corrupted`.

mod config;
mod sanity;
mod state;

pub use config::EngineConfig;
pub use sanity::SanityError;
pub use state::{JoinState, MemberSummary};

use crate::error::{AndError, AndResult};
use crate::event::{EngineEvent, PeerSession};
use crate::ids::{IdentityHash, ObjectId, SessionId};
use crate::protocol::{ObjectInfo, PeerSessionInfo};
use crate::transport::AndPeer;
use crate::url::PeerUrl;
use state::EngineState;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::error;

pub struct Engine {
    local: IdentityHash,
    state: Mutex<EngineState>,
    poisoned: AtomicBool,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("local", &self.local)
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(local: IdentityHash, config: EngineConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            local,
            state: Mutex::new(EngineState::new(local, config)),
            poisoned: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn local_identity(&self) -> &IdentityHash {
        &self.local
    }

    /// The event stream. Can be taken once.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Verify the structural invariants. A failure poisons the engine.
    pub fn check_sanity(&self) -> Result<(), SanityError> {
        let result = self.lock().check();
        if let Err(e) = &result {
            self.poison("check_sanity", e.to_string());
        }
        result
    }

    // ==================== Local operations ====================

    /// Open a new world hosted here. Resolves at once with `JoinSuccess`.
    pub fn open_world(&self, local: SessionId, text: &str) -> AndResult {
        self.mutate("open_world", |s| s.open_world(local, text))
    }

    /// Start joining the world at `target`. Resolves later with `JoinSuccess` or `JoinFail`.
    pub fn join_world(&self, local: SessionId, target: &PeerUrl) -> AndResult {
        self.mutate("join_world", |s| s.join_world(local, target))
    }

    pub fn cancel_join(&self, local: SessionId) -> AndResult {
        self.mutate("cancel_join", |s| s.cancel_join(local))
    }

    /// Leave a joined world, or cancel a join still in progress.
    pub fn close_world(&self, local: SessionId) -> AndResult {
        self.mutate("close_world", |s| s.close_world(local))
    }

    pub fn append_objects(
        &self,
        local: SessionId,
        to: &IdentityHash,
        objects: Vec<ObjectInfo>,
    ) -> AndResult {
        self.mutate("append_objects", |s| s.append_objects(local, to, objects))
    }

    pub fn delete_objects(
        &self,
        local: SessionId,
        to: &IdentityHash,
        object_ids: Vec<ObjectId>,
    ) -> AndResult {
        self.mutate("delete_objects", |s| s.delete_objects(local, to, object_ids))
    }

    // ==================== Application decisions ====================

    pub fn accept_session(&self, local: SessionId, peer: &PeerSession) -> AndResult {
        self.mutate("accept_session", |s| s.accept_session(local, peer))
    }

    pub fn decline_session(
        &self,
        local: SessionId,
        peer: &PeerSession,
        code: i32,
        text: &str,
    ) -> AndResult {
        self.mutate("decline_session", |s| {
            s.decline_session(local, peer, code, text)
        })
    }

    /// Answer a JN that resolved to no world.
    pub fn reject_join(&self, peer: &PeerSession, code: i32, text: &str) -> AndResult {
        self.mutate("reject_join", |s| s.reject_join(peer, code, text))
    }

    // ==================== Connectivity ====================

    pub fn peer_connected(&self, peer: Arc<dyn AndPeer>) -> AndResult {
        self.mutate("peer_connected", |s| s.peer_connected(peer))
    }

    pub fn peer_disconnected(&self, identity: &IdentityHash) -> AndResult {
        self.mutate("peer_disconnected", |s| s.peer_disconnected(identity))
    }

    pub fn timer_expire(&self, local: SessionId) -> AndResult {
        self.mutate("timer_expire", |s| s.timer_expire(local))
    }

    // ==================== Protocol messages ====================

    pub fn jn(&self, local: SessionId, peer: &PeerSession) -> AndResult {
        self.mutate("JN", |s| s.jn(local, peer))
    }

    pub fn jok(
        &self,
        local: SessionId,
        peer: &PeerSession,
        text: &str,
        neighbors: &[PeerSessionInfo],
    ) -> AndResult {
        self.mutate("JOK", |s| s.jok(local, peer, text, neighbors))
    }

    pub fn jdn(&self, local: SessionId, peer: &PeerSession, code: i32, text: &str) -> AndResult {
        self.mutate("JDN", |s| s.jdn(local, peer, code, text))
    }

    pub fn jni(&self, local: SessionId, peer: &PeerSession, neighbor: &PeerSessionInfo) -> AndResult {
        self.mutate("JNI", |s| s.jni(local, peer, neighbor))
    }

    pub fn mem(&self, local: SessionId, peer: &PeerSession) -> AndResult {
        self.mutate("MEM", |s| s.mem(local, peer))
    }

    pub fn snb(&self, local: SessionId, peer: &PeerSession, members: &[PeerSessionInfo]) -> AndResult {
        self.mutate("SNB", |s| s.snb(local, peer, members))
    }

    pub fn crr(&self, local: SessionId, peer: &PeerSession, members: &[PeerSessionInfo]) -> AndResult {
        self.mutate("CRR", |s| s.crr(local, peer, members))
    }

    pub fn rst(&self, local: SessionId, peer: &PeerSession) -> AndResult {
        self.mutate("RST", |s| s.rst(local, peer))
    }

    pub fn soa(&self, local: SessionId, peer: &PeerSession, objects: Vec<ObjectInfo>) -> AndResult {
        self.mutate("SOA", |s| s.soa(local, peer, objects))
    }

    pub fn sod(&self, local: SessionId, peer: &PeerSession, object_ids: Vec<ObjectId>) -> AndResult {
        self.mutate("SOD", |s| s.sod(local, peer, object_ids))
    }

    // ==================== Introspection ====================

    pub fn is_open(&self, local: SessionId) -> bool {
        self.lock().worlds.contains_key(&local)
    }

    pub fn is_retired(&self, local: SessionId) -> bool {
        self.lock().retired.contains(&local)
    }

    pub fn world_count(&self) -> usize {
        self.lock().worlds.len()
    }

    /// Member entries of a world, sorted by identity.
    pub fn members(&self, local: SessionId) -> Option<Vec<MemberSummary>> {
        self.lock().members(local)
    }

    /// Objects a member has announced into a world, sorted by id.
    pub fn objects_of(&self, local: SessionId, peer: &IdentityHash) -> Vec<ObjectInfo> {
        self.lock().objects_of(local, peer)
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mutate<F>(&self, op: &'static str, f: F) -> AndResult
    where
        F: FnOnce(&mut EngineState) -> AndResult,
    {
        if self.is_poisoned() {
            return Err(AndError::Corrupted(format!(
                "{op} refused: engine is poisoned"
            )));
        }

        let mut state = self.lock();
        let result = f(&mut state);
        let breach = match &result {
            Err(AndError::Corrupted(reason)) => Some(reason.clone()),
            _ if state.net.config.verify_after_mutation => {
                state.check().err().map(|e| e.to_string())
            }
            _ => None,
        };
        // Events leave under the lock so their order matches the state changes.
        for event in state.net.outbox.drain(..) {
            let _ = self.events_tx.send(event);
        }
        drop(state);

        match breach {
            Some(reason) => {
                self.poison(op, reason.clone());
                Err(AndError::Corrupted(reason))
            }
            None => result,
        }
    }

    fn poison(&self, op: &str, reason: String) {
        if self.poisoned.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("Engine corrupted during {}: {}", op, reason);
        let _ = self.events_tx.send(EngineEvent::Fault { reason });
    }
}
