//! Application-facing view of one world session.
//!
//! A `World` is handed out by `Host::open_world` / `Host::join_world`. It
//! yields `WorldEvent`s in the order the engine produced them and ends with
//! `Terminate`. It only refers to the engine and its own session id; the host
//! routes events to it through its world table.

use crate::error::WorldError;
use and_core::{
    Engine, IdentityHash, MemberSummary, ObjectId, ObjectInfo, PeerSession, SessionId,
};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum WorldEvent {
    /// A peer wants to join; accept or decline it.
    PeerRequest(PeerRequest),
    /// A peer became a member.
    PeerReady(WorldPeer),
    ObjectAppend {
        peer: IdentityHash,
        objects: Vec<ObjectInfo>,
    },
    ObjectDelete {
        peer: IdentityHash,
        object_ids: Vec<ObjectId>,
    },
    PeerLeave(WorldPeer),
    /// The world was closed. No further events follow.
    Terminate,
}

/// A pending join request. Cloneable; only the first accept or decline counts.
#[derive(Clone)]
pub struct PeerRequest {
    engine: Arc<Engine>,
    local: SessionId,
    peer: PeerSession,
    resolved: Arc<AtomicBool>,
}

impl fmt::Debug for PeerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRequest")
            .field("local", &self.local)
            .field("peer", &self.peer.identity().short())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl PeerRequest {
    pub(crate) fn new(engine: Arc<Engine>, local: SessionId, peer: PeerSession) -> Self {
        Self {
            engine,
            local,
            peer,
            resolved: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn identity(&self) -> &IdentityHash {
        self.peer.identity()
    }

    pub fn session_id(&self) -> SessionId {
        self.peer.session_id
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    pub fn accept(&self) -> Result<(), WorldError> {
        self.claim()?;
        self.engine.accept_session(self.local, &self.peer)?;
        Ok(())
    }

    pub fn decline(&self, code: i32, message: &str) -> Result<(), WorldError> {
        self.claim()?;
        self.engine
            .decline_session(self.local, &self.peer, code, message)?;
        Ok(())
    }

    fn claim(&self) -> Result<(), WorldError> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return Err(WorldError::AlreadyResolved);
        }
        Ok(())
    }
}

/// A member of a world, as seen from this node.
#[derive(Clone)]
pub struct WorldPeer {
    engine: Arc<Engine>,
    local: SessionId,
    peer: PeerSession,
}

impl fmt::Debug for WorldPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldPeer")
            .field("local", &self.local)
            .field("peer", &self.peer.identity().short())
            .field("session_id", &self.peer.session_id)
            .finish()
    }
}

impl WorldPeer {
    pub(crate) fn new(engine: Arc<Engine>, local: SessionId, peer: PeerSession) -> Self {
        Self { engine, local, peer }
    }

    pub fn identity(&self) -> &IdentityHash {
        self.peer.identity()
    }

    /// The session id the peer uses for this world.
    pub fn session_id(&self) -> SessionId {
        self.peer.session_id
    }

    /// Announce objects to this peer.
    pub fn append_objects(&self, objects: Vec<ObjectInfo>) -> Result<(), WorldError> {
        self.engine
            .append_objects(self.local, self.peer.identity(), objects)?;
        Ok(())
    }

    /// Withdraw previously announced objects from this peer.
    pub fn delete_objects(&self, object_ids: Vec<ObjectId>) -> Result<(), WorldError> {
        self.engine
            .delete_objects(self.local, self.peer.identity(), object_ids)?;
        Ok(())
    }
}

pub struct World {
    engine: Arc<Engine>,
    session_id: SessionId,
    text: String,
    events: mpsc::UnboundedReceiver<WorldEvent>,
    terminated: bool,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("session_id", &self.session_id)
            .field("text", &self.text)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl World {
    pub(crate) fn new(
        engine: Arc<Engine>,
        session_id: SessionId,
        text: String,
        events: mpsc::UnboundedReceiver<WorldEvent>,
    ) -> Self {
        Self {
            engine,
            session_id,
            text,
            events,
            terminated: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The world's address text as agreed when it was opened or joined.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Next event, waiting if needed. `None` after `Terminate` or once the host stops.
    pub async fn next_event(&mut self) -> Option<WorldEvent> {
        if self.terminated {
            return None;
        }
        let event = self.events.recv().await;
        match event {
            Some(WorldEvent::Terminate) | None => self.terminated = true,
            Some(_) => {}
        }
        event
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<WorldEvent> {
        if self.terminated {
            return None;
        }
        let event = self.events.try_recv().ok();
        if matches!(event, Some(WorldEvent::Terminate)) {
            self.terminated = true;
        }
        event
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Current member table, or `None` once the world is closed.
    pub fn members(&self) -> Option<Vec<MemberSummary>> {
        self.engine.members(self.session_id)
    }

    pub fn append_objects(
        &self,
        to: &IdentityHash,
        objects: Vec<ObjectInfo>,
    ) -> Result<(), WorldError> {
        self.engine.append_objects(self.session_id, to, objects)?;
        Ok(())
    }

    pub fn delete_objects(
        &self,
        to: &IdentityHash,
        object_ids: Vec<ObjectId>,
    ) -> Result<(), WorldError> {
        self.engine.delete_objects(self.session_id, to, object_ids)?;
        Ok(())
    }
}
