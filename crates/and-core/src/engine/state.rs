//! World sessions, their members, and the protocol transitions over them.
//!
//! `EngineState` is only ever touched under the engine lock. Handlers either
//! succeed, or return `AndError::Invalid` without having changed anything.

use super::config::EngineConfig;
use crate::error::{AndError, AndResult};
use crate::event::{EngineEvent, PeerSession};
use crate::identity::PeerCertificates;
use crate::ids::{IdentityHash, ObjectId, SessionId};
use crate::protocol::{
    AhmpMessage, DECLINE_DEFAULT, JOIN_CANCELLED, JOIN_PEER_LOST, JOIN_TIMEOUT, ObjectInfo,
    PeerSessionInfo,
};
use crate::transport::AndPeer;
use crate::url::PeerUrl;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ticks an unconnected entry waits for the other side to dial before we dial ourselves.
const DIAL_FALLBACK_TICKS: u64 = 2;

/// Where a member entry stands in the session handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// Learned about, not yet probed.
    Init,
    /// We sent MEM and wait for theirs.
    JoinSent,
    /// The peer sent JN; the application has not decided yet.
    Requested,
    Established,
}

/// Read-only view of a member entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSummary {
    pub identity: IdentityHash,
    pub session_id: SessionId,
    pub state: JoinState,
}

#[derive(Debug, Clone)]
pub(crate) enum WorldPhase {
    Joining {
        target: PeerUrl,
        sent: bool,
        attempts: u32,
    },
    Joined,
}

#[derive(Debug, Clone)]
pub(crate) struct Member {
    pub url: PeerUrl,
    pub certificates: PeerCertificates,
    pub session_id: SessionId,
    pub state: JoinState,
    pub since_tick: u64,
}

impl Member {
    fn from_peer(peer: &PeerSession, state: JoinState, tick: u64) -> Self {
        Self {
            url: peer.peer.url().clone(),
            certificates: peer.peer.certificates().clone(),
            session_id: peer.session_id,
            state,
            since_tick: tick,
        }
    }

    fn info(&self) -> PeerSessionInfo {
        PeerSessionInfo {
            url: self.url.clone(),
            session_id: self.session_id,
            certificates: self.certificates.clone(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct WorldSession {
    pub local: SessionId,
    pub text: String,
    pub phase: WorldPhase,
    pub members: HashMap<IdentityHash, Member>,
    /// Objects announced by each established member.
    pub objects: HashMap<IdentityHash, HashMap<ObjectId, String>>,
    pub ticks: u64,
}

impl WorldSession {
    fn new(local: SessionId, text: String, phase: WorldPhase) -> Self {
        Self {
            local,
            text,
            phase,
            members: HashMap::new(),
            objects: HashMap::new(),
            ticks: 0,
        }
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.phase, WorldPhase::Joined)
    }

    fn is_joining_via(&self, identity: &IdentityHash) -> bool {
        matches!(&self.phase, WorldPhase::Joining { target, .. } if target.identity == *identity)
    }

    fn established_infos(&self, except: Option<&IdentityHash>) -> Vec<PeerSessionInfo> {
        self.members
            .iter()
            .filter(|(id, m)| m.state == JoinState::Established && Some(*id) != except)
            .map(|(_, m)| m.info())
            .collect()
    }

    fn established_sessions(&self) -> Vec<(IdentityHash, SessionId)> {
        self.members
            .iter()
            .filter(|(_, m)| m.state == JoinState::Established)
            .map(|(id, m)| (*id, m.session_id))
            .collect()
    }

    fn require_established(&self, peer: &PeerSession) -> AndResult {
        match self.members.get(peer.identity()) {
            Some(m) if m.state == JoinState::Established && m.session_id == peer.session_id => {
                Ok(())
            }
            _ => Err(AndError::invalid(format!(
                "{}/{} is not an established member of {}",
                peer.identity().short(),
                peer.session_id,
                self.local
            ))),
        }
    }

    fn member_state(&self, identity: &IdentityHash) -> Option<(JoinState, SessionId)> {
        self.members.get(identity).map(|m| (m.state, m.session_id))
    }

    /// Peer session ids are unique within a world; a different member must not hold `session_id`.
    fn require_unclaimed(&self, identity: &IdentityHash, session_id: SessionId) -> AndResult {
        let holder = self
            .members
            .iter()
            .find(|(id, m)| *id != identity && m.session_id == session_id);
        match holder {
            Some((holder, _)) => Err(AndError::invalid(format!(
                "peer session {} of {} already belongs to {} in {}",
                session_id,
                identity.short(),
                holder.short(),
                self.local
            ))),
            None => Ok(()),
        }
    }
}

/// Connections and outgoing events, split from the world table so handlers
/// can hold a world mutably while sending.
pub(crate) struct Net {
    pub local: IdentityHash,
    pub config: EngineConfig,
    pub peers: HashMap<IdentityHash, Arc<dyn AndPeer>>,
    pub outbox: Vec<EngineEvent>,
}

impl Net {
    fn emit(&mut self, event: EngineEvent) {
        self.outbox.push(event);
    }

    fn is_connected(&self, identity: &IdentityHash) -> bool {
        self.peers.contains_key(identity)
    }

    fn require_registered(&self, identity: &IdentityHash) -> AndResult {
        if self.is_connected(identity) {
            Ok(())
        } else {
            Err(AndError::invalid(format!(
                "message from unregistered peer {}",
                identity.short()
            )))
        }
    }

    /// Non-blocking send to a connected peer. Returns false if nothing was queued.
    fn send(&self, to: &IdentityHash, message: AhmpMessage) -> bool {
        let kind = message.kind();
        match self.peers.get(to) {
            Some(peer) => match peer.send(message) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to send {} to {}: {}", kind, to.short(), e);
                    false
                }
            },
            None => {
                debug!("No connection to {}, dropping {}", to.short(), kind);
                false
            }
        }
    }

    fn session(&self, identity: &IdentityHash, session_id: SessionId) -> Option<PeerSession> {
        self.peers
            .get(identity)
            .map(|peer| PeerSession::new(peer.clone(), session_id))
    }

    fn probe(&self, local: SessionId, identity: &IdentityHash, member: &mut Member) {
        let mem = AhmpMessage::Mem {
            recver: member.session_id,
            sender: local,
        };
        if self.send(identity, mem) {
            member.state = JoinState::JoinSent;
        }
    }

    /// Start a session with a member we just learned about.
    ///
    /// Only the side with the lower identity dials, so two peers learning
    /// about each other at once end up with a single connection.
    fn bootstrap(&mut self, world: &mut WorldSession, info: &PeerSessionInfo) -> AndResult {
        let identity = info.identity();
        if identity == self.local || world.members.contains_key(&identity) {
            return Ok(());
        }
        world.require_unclaimed(&identity, info.session_id)?;
        let mut member = Member {
            url: info.url.clone(),
            certificates: info.certificates.clone(),
            session_id: info.session_id,
            state: JoinState::Init,
            since_tick: world.ticks,
        };
        self.emit(EngineEvent::PeerRegister {
            certificates: info.certificates.clone(),
        });
        if self.is_connected(&identity) {
            self.probe(world.local, &identity, &mut member);
        } else if self.local < identity {
            self.emit(EngineEvent::ConnectRequest {
                url: info.url.clone(),
            });
        }
        debug!(
            "World {}: learned of {} ({:?})",
            world.local,
            identity.short(),
            member.state
        );
        world.members.insert(identity, member);
        Ok(())
    }

    /// Bootstrap an entry of a member list sent by someone else; a conflicting entry is skipped.
    fn bootstrap_listed(&mut self, world: &mut WorldSession, info: &PeerSessionInfo) {
        if let Err(e) = self.bootstrap(world, info) {
            debug!("World {}: skipping listed peer: {}", world.local, e);
        }
    }

    /// Remove a member and its objects, reporting the close if it was established.
    fn drop_member(&mut self, world: &mut WorldSession, identity: &IdentityHash) -> Option<Member> {
        let member = world.members.remove(identity)?;
        world.objects.remove(identity);
        if member.state == JoinState::Established
            && let Some(peer) = self.session(identity, member.session_id)
        {
            self.emit(EngineEvent::SessionClose {
                local: world.local,
                peer,
            });
        }
        Some(member)
    }

    fn heartbeat(&mut self, world: &mut WorldSession) {
        world.ticks += 1;
        let snapshot_due = world.ticks % self.config.snapshot_every.max(1) == 0;

        for (identity, session_id) in world.established_sessions() {
            self.send(
                &identity,
                AhmpMessage::Mem {
                    recver: session_id,
                    sender: world.local,
                },
            );
            if snapshot_due {
                self.send(
                    &identity,
                    AhmpMessage::Snb {
                        recver: session_id,
                        sender: world.local,
                        members: world.established_infos(Some(&identity)),
                    },
                );
            }
        }

        let mut stale = Vec::new();
        for (identity, member) in world.members.iter_mut() {
            let age = world.ticks.saturating_sub(member.since_tick);
            match member.state {
                JoinState::Init | JoinState::JoinSent if age >= self.config.stale_handshake_ticks => {
                    stale.push(*identity);
                }
                JoinState::Init if self.is_connected(identity) => {
                    self.probe(world.local, identity, member);
                }
                JoinState::Init if age == DIAL_FALLBACK_TICKS => {
                    self.outbox.push(EngineEvent::ConnectRequest {
                        url: member.url.clone(),
                    });
                }
                _ => {}
            }
        }
        for identity in stale {
            world.members.remove(&identity);
            self.emit(EngineEvent::NeighborDebug {
                text: format!(
                    "world {}: gave up on unconfirmed member {}",
                    world.local,
                    identity.short()
                ),
            });
        }

        self.emit(EngineEvent::TimerRequest {
            local: world.local,
            after: self.config.heartbeat_interval,
        });
    }
}

pub(crate) struct EngineState {
    pub net: Net,
    pub worlds: HashMap<SessionId, WorldSession>,
    /// Session ids that were closed or failed. Never reused.
    pub retired: HashSet<SessionId>,
}

fn unknown_session(local: SessionId) -> AndError {
    AndError::invalid(format!("unknown session {local}"))
}

fn joined_world(
    worlds: &mut HashMap<SessionId, WorldSession>,
    local: SessionId,
) -> AndResult<&mut WorldSession> {
    match worlds.get_mut(&local) {
        Some(world) if world.is_joined() => Ok(world),
        Some(_) => Err(AndError::invalid(format!("session {local} is still joining"))),
        None => Err(unknown_session(local)),
    }
}

impl EngineState {
    pub fn new(local: IdentityHash, config: EngineConfig) -> Self {
        Self {
            net: Net {
                local,
                config,
                peers: HashMap::new(),
                outbox: Vec::new(),
            },
            worlds: HashMap::new(),
            retired: HashSet::new(),
        }
    }

    fn ensure_fresh(&self, local: SessionId) -> AndResult {
        if self.worlds.contains_key(&local) || self.retired.contains(&local) {
            Err(AndError::invalid(format!("session {local} was already used")))
        } else {
            Ok(())
        }
    }

    fn retire(&mut self, local: SessionId) -> Option<WorldSession> {
        self.retired.insert(local);
        self.worlds.remove(&local)
    }

    fn fail_join(&mut self, local: SessionId, code: i32, text: String) {
        self.retire(local);
        info!("Join {} failed ({}): {}", local, code, text);
        self.net.emit(EngineEvent::JoinFail { local, code, text });
    }

    // ==================== Local operations ====================

    pub fn open_world(&mut self, local: SessionId, text: &str) -> AndResult {
        if text.trim().is_empty() {
            return Err(AndError::invalid("world address must not be empty"));
        }
        self.ensure_fresh(local)?;

        self.worlds.insert(
            local,
            WorldSession::new(local, text.to_string(), WorldPhase::Joined),
        );
        info!("Opened world {} as {:?}", local, text);
        self.net.emit(EngineEvent::JoinSuccess {
            local,
            text: text.to_string(),
        });
        self.net.emit(EngineEvent::TimerRequest {
            local,
            after: self.net.config.heartbeat_interval,
        });
        Ok(())
    }

    pub fn join_world(&mut self, local: SessionId, target: &PeerUrl) -> AndResult {
        self.ensure_fresh(local)?;
        if target.identity == self.net.local {
            return Err(AndError::invalid("cannot join a world through ourselves"));
        }
        let connected = self.net.is_connected(&target.identity);
        if target.address.is_empty() && !connected {
            return Err(AndError::invalid(format!("no route to {target}")));
        }

        if connected {
            self.net.send(
                &target.identity,
                AhmpMessage::Jn {
                    text: target.path.clone(),
                    sender: local,
                },
            );
        } else {
            self.net.emit(EngineEvent::ConnectRequest {
                url: target.clone(),
            });
        }
        self.worlds.insert(
            local,
            WorldSession::new(
                local,
                target.to_string(),
                WorldPhase::Joining {
                    target: target.clone(),
                    sent: connected,
                    attempts: 0,
                },
            ),
        );
        info!("Joining {} as {}", target, local);
        self.net.emit(EngineEvent::TimerRequest {
            local,
            after: self.net.config.join_retry_interval,
        });
        Ok(())
    }

    pub fn cancel_join(&mut self, local: SessionId) -> AndResult {
        match self.worlds.get(&local).map(|w| w.is_joined()) {
            Some(false) => {}
            Some(true) => return Err(AndError::invalid(format!("session {local} is not joining"))),
            None => return Err(unknown_session(local)),
        }
        self.fail_join(local, JOIN_CANCELLED, "join cancelled".to_string());
        Ok(())
    }

    pub fn close_world(&mut self, local: SessionId) -> AndResult {
        match self.worlds.get(&local).map(|w| w.is_joined()) {
            Some(true) => {}
            Some(false) => {
                self.fail_join(local, JOIN_CANCELLED, "join cancelled".to_string());
                return Ok(());
            }
            None => return Err(unknown_session(local)),
        }
        let Some(world) = self.retire(local) else {
            return Err(unknown_session(local));
        };

        for (identity, member) in &world.members {
            let notice = match member.state {
                JoinState::Established | JoinState::JoinSent => AhmpMessage::Rst {
                    recver: member.session_id,
                    sender: local,
                },
                JoinState::Requested => AhmpMessage::Jdn {
                    recver: member.session_id,
                    code: DECLINE_DEFAULT,
                    text: "world closed".to_string(),
                },
                JoinState::Init => continue,
            };
            self.net.send(identity, notice);
        }
        info!("Closed world {} ({} members)", local, world.members.len());
        self.net.emit(EngineEvent::WorldLeave { local });
        Ok(())
    }

    pub fn append_objects(
        &mut self,
        local: SessionId,
        to: &IdentityHash,
        objects: Vec<ObjectInfo>,
    ) -> AndResult {
        let world = joined_world(&mut self.worlds, local)?;
        let Some(session_id) = established_session_of(world, to) else {
            return Err(AndError::invalid(format!(
                "{} is not an established member of {local}",
                to.short()
            )));
        };
        self.net.send(
            to,
            AhmpMessage::Soa {
                recver: session_id,
                sender: local,
                objects,
            },
        );
        Ok(())
    }

    pub fn delete_objects(
        &mut self,
        local: SessionId,
        to: &IdentityHash,
        object_ids: Vec<ObjectId>,
    ) -> AndResult {
        let world = joined_world(&mut self.worlds, local)?;
        let Some(session_id) = established_session_of(world, to) else {
            return Err(AndError::invalid(format!(
                "{} is not an established member of {local}",
                to.short()
            )));
        };
        self.net.send(
            to,
            AhmpMessage::Sod {
                recver: session_id,
                sender: local,
                object_ids,
            },
        );
        Ok(())
    }

    // ==================== Application decisions ====================

    pub fn accept_session(&mut self, local: SessionId, peer: &PeerSession) -> AndResult {
        let identity = *peer.identity();
        let world = joined_world(&mut self.worlds, local)?;
        let joiner = match world.members.get(&identity) {
            Some(m) if m.state == JoinState::Requested && m.session_id == peer.session_id => {
                m.info()
            }
            _ => {
                return Err(AndError::invalid(format!(
                    "no pending join request from {} in {local}",
                    identity.short()
                )));
            }
        };

        self.net.send(
            &identity,
            AhmpMessage::Jok {
                recver: peer.session_id,
                sender: local,
                text: world.text.clone(),
                neighbors: world.established_infos(Some(&identity)),
            },
        );
        for (member, session_id) in world.established_sessions() {
            self.net.send(
                &member,
                AhmpMessage::Jni {
                    recver: session_id,
                    sender: local,
                    neighbor: joiner.clone(),
                },
            );
        }
        if let Some(member) = world.members.get_mut(&identity) {
            member.state = JoinState::Established;
            member.since_tick = world.ticks;
        }
        info!("World {}: accepted {}", local, identity.short());
        self.net.emit(EngineEvent::SessionReady {
            local,
            peer: peer.clone(),
        });
        Ok(())
    }

    pub fn decline_session(
        &mut self,
        local: SessionId,
        peer: &PeerSession,
        code: i32,
        text: &str,
    ) -> AndResult {
        let identity = *peer.identity();
        let world = joined_world(&mut self.worlds, local)?;
        match world.member_state(&identity) {
            Some((JoinState::Requested, sid)) if sid == peer.session_id => {}
            _ => {
                return Err(AndError::invalid(format!(
                    "no pending join request from {} in {local}",
                    identity.short()
                )));
            }
        }
        world.members.remove(&identity);
        self.net.send(
            &identity,
            AhmpMessage::Jdn {
                recver: peer.session_id,
                code,
                text: text.to_string(),
            },
        );
        info!("World {}: declined {} ({})", local, identity.short(), code);
        Ok(())
    }

    /// Decline a JN that names no world. No state is involved.
    pub fn reject_join(&mut self, peer: &PeerSession, code: i32, text: &str) -> AndResult {
        let jdn = AhmpMessage::Jdn {
            recver: peer.session_id,
            code,
            text: text.to_string(),
        };
        if let Err(e) = peer.peer.send(jdn) {
            warn!("Failed to send JDN to {}: {}", peer.identity().short(), e);
        }
        Ok(())
    }

    // ==================== Connectivity ====================

    pub fn peer_connected(&mut self, peer: Arc<dyn AndPeer>) -> AndResult {
        let identity = *peer.identity();
        if identity == self.net.local {
            return Err(AndError::invalid("refusing a connection to ourselves"));
        }
        if self.net.is_connected(&identity) {
            return Err(AndError::invalid(format!(
                "peer {} is already connected",
                identity.short()
            )));
        }
        self.net.peers.insert(identity, peer);
        debug!("Peer {} connected", identity.short());

        for world in self.worlds.values_mut() {
            match &mut world.phase {
                WorldPhase::Joining { target, sent, .. } => {
                    if target.identity == identity && !*sent {
                        *sent = self.net.send(
                            &identity,
                            AhmpMessage::Jn {
                                text: target.path.clone(),
                                sender: world.local,
                            },
                        );
                    }
                }
                WorldPhase::Joined => {
                    if let Some(member) = world.members.get_mut(&identity)
                        && member.state == JoinState::Init
                    {
                        self.net.probe(world.local, &identity, member);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn peer_disconnected(&mut self, identity: &IdentityHash) -> AndResult {
        if !self.net.is_connected(identity) {
            return Err(AndError::invalid(format!(
                "peer {} is not connected",
                identity.short()
            )));
        }

        let mut failed = Vec::new();
        for world in self.worlds.values_mut() {
            if world.is_joining_via(identity) {
                failed.push(world.local);
            } else if world.is_joined() {
                self.net.drop_member(world, identity);
            }
        }
        for local in failed {
            self.fail_join(
                local,
                JOIN_PEER_LOST,
                format!("lost connection to {}", identity.short()),
            );
        }

        self.net.peers.remove(identity);
        debug!("Peer {} disconnected", identity.short());
        Ok(())
    }

    // ==================== Protocol messages ====================

    pub fn jn(&mut self, local: SessionId, peer: &PeerSession) -> AndResult {
        let identity = *peer.identity();
        self.net.require_registered(&identity)?;
        let world = joined_world(&mut self.worlds, local)?;
        world.require_unclaimed(&identity, peer.session_id)?;

        match world.member_state(&identity) {
            Some((JoinState::Requested, _)) => {
                return Err(AndError::invalid(format!(
                    "join request from {} is already pending",
                    identity.short()
                )));
            }
            Some((JoinState::Established, sid)) if sid == peer.session_id => {
                return Err(AndError::invalid(format!(
                    "{} is already a member of {local}",
                    identity.short()
                )));
            }
            Some(_) => {
                self.net.drop_member(world, &identity);
            }
            None => {}
        }

        world.members.insert(
            identity,
            Member::from_peer(peer, JoinState::Requested, world.ticks),
        );
        debug!("World {}: join request from {}", local, identity.short());
        self.net.emit(EngineEvent::SessionRequest {
            local,
            peer: peer.clone(),
        });
        Ok(())
    }

    pub fn jok(
        &mut self,
        local: SessionId,
        peer: &PeerSession,
        text: &str,
        neighbors: &[PeerSessionInfo],
    ) -> AndResult {
        let identity = *peer.identity();
        self.net.require_registered(&identity)?;

        let Some(world) = self.worlds.get_mut(&local) else {
            if self.retired.contains(&local) {
                // The join was abandoned here; the acceptor must forget us.
                self.net.send(
                    &identity,
                    AhmpMessage::Rst {
                        recver: peer.session_id,
                        sender: local,
                    },
                );
                return Err(AndError::invalid(format!("JOK for retired session {local}")));
            }
            return Err(unknown_session(local));
        };
        if !world.is_joining_via(&identity) {
            return Err(AndError::invalid(format!(
                "JOK from {} does not answer a pending join",
                identity.short()
            )));
        }

        world.phase = WorldPhase::Joined;
        world.text = text.to_string();
        world.members.insert(
            identity,
            Member::from_peer(peer, JoinState::Established, world.ticks),
        );
        info!(
            "Joined world {} via {} ({} neighbors)",
            local,
            identity.short(),
            neighbors.len()
        );
        self.net.emit(EngineEvent::JoinSuccess {
            local,
            text: text.to_string(),
        });
        self.net.emit(EngineEvent::SessionReady {
            local,
            peer: peer.clone(),
        });
        for neighbor in neighbors {
            self.net.bootstrap_listed(world, neighbor);
        }
        Ok(())
    }

    pub fn jdn(&mut self, local: SessionId, peer: &PeerSession, code: i32, text: &str) -> AndResult {
        let identity = *peer.identity();
        match self.worlds.get(&local) {
            Some(world) if world.is_joining_via(&identity) => {}
            Some(_) => {
                return Err(AndError::invalid(format!(
                    "JDN from {} does not answer a pending join",
                    identity.short()
                )));
            }
            None => return Err(unknown_session(local)),
        }
        self.fail_join(local, code, text.to_string());
        Ok(())
    }

    pub fn jni(&mut self, local: SessionId, peer: &PeerSession, neighbor: &PeerSessionInfo) -> AndResult {
        self.net.require_registered(peer.identity())?;
        let world = joined_world(&mut self.worlds, local)?;
        world.require_established(peer)?;
        if neighbor.identity() == self.net.local {
            return Err(AndError::invalid("JNI introduces ourselves"));
        }
        self.net.bootstrap(world, neighbor)
    }

    pub fn mem(&mut self, local: SessionId, peer: &PeerSession) -> AndResult {
        let identity = *peer.identity();
        self.net.require_registered(&identity)?;
        let world = joined_world(&mut self.worlds, local)?;
        world.require_unclaimed(&identity, peer.session_id)?;

        let prior = world.member_state(&identity);
        match prior {
            Some((JoinState::Established, sid)) if sid == peer.session_id => {
                if let Some(member) = world.members.get_mut(&identity) {
                    member.since_tick = world.ticks;
                }
                return Ok(());
            }
            Some((JoinState::Requested, _)) => {
                return Err(AndError::invalid(format!(
                    "MEM from {} while its join request is pending",
                    identity.short()
                )));
            }
            Some((JoinState::Established, _)) => {
                // Same peer, new session: the old one is gone.
                self.net.drop_member(world, &identity);
            }
            _ => {}
        }

        world.members.insert(
            identity,
            Member::from_peer(peer, JoinState::Established, world.ticks),
        );
        debug!("World {}: session with {} ready", local, identity.short());
        self.net.emit(EngineEvent::SessionReady {
            local,
            peer: peer.clone(),
        });
        // Our own MEM to this session is already on its way.
        let answered = prior == Some((JoinState::JoinSent, peer.session_id));
        if !answered {
            self.net.send(
                &identity,
                AhmpMessage::Mem {
                    recver: peer.session_id,
                    sender: local,
                },
            );
        }
        Ok(())
    }

    pub fn snb(&mut self, local: SessionId, peer: &PeerSession, members: &[PeerSessionInfo]) -> AndResult {
        let identity = *peer.identity();
        self.net.require_registered(&identity)?;
        let world = joined_world(&mut self.worlds, local)?;
        world.require_established(peer)?;

        let mut diverged = false;
        for info in members {
            let listed = info.identity();
            if listed == self.net.local {
                diverged |= info.session_id != local;
                continue;
            }
            if listed == identity {
                continue;
            }
            match world.members.get(&listed) {
                None => self.net.bootstrap_listed(world, info),
                Some(m) if m.state == JoinState::Established && m.session_id != info.session_id => {
                    diverged = true;
                }
                Some(_) => {}
            }
        }

        if diverged {
            self.net.emit(EngineEvent::NeighborDebug {
                text: format!(
                    "world {}: snapshot from {} disagrees, requesting repair",
                    local,
                    identity.short()
                ),
            });
            self.net.send(
                &identity,
                AhmpMessage::Crr {
                    recver: peer.session_id,
                    sender: local,
                    members: world.established_infos(None),
                },
            );
        }
        Ok(())
    }

    pub fn crr(&mut self, local: SessionId, peer: &PeerSession, members: &[PeerSessionInfo]) -> AndResult {
        let identity = *peer.identity();
        self.net.require_registered(&identity)?;
        let world = joined_world(&mut self.worlds, local)?;
        let Some((_, known_session)) = world.member_state(&identity) else {
            return Err(AndError::invalid(format!(
                "CRR from non-member {}",
                identity.short()
            )));
        };

        let mut reset = known_session != peer.session_id;
        for info in members {
            let listed = info.identity();
            if listed == self.net.local {
                reset |= info.session_id != local;
                continue;
            }
            if listed == identity {
                continue;
            }
            match world.member_state(&listed) {
                None => self.net.bootstrap_listed(world, info),
                Some((JoinState::Established, sid)) if sid != info.session_id => {
                    self.net.drop_member(world, &listed);
                    self.net.bootstrap_listed(world, info);
                }
                Some(_) => {}
            }
        }

        if reset {
            self.net.emit(EngineEvent::NeighborDebug {
                text: format!(
                    "world {}: resetting session with {}",
                    local,
                    identity.short()
                ),
            });
            self.net.send(
                &identity,
                AhmpMessage::Rst {
                    recver: peer.session_id,
                    sender: local,
                },
            );
            self.net.drop_member(world, &identity);
            let fresh = PeerSessionInfo {
                url: peer.peer.url().clone(),
                session_id: peer.session_id,
                certificates: peer.peer.certificates().clone(),
            };
            self.net.bootstrap_listed(world, &fresh);
        }
        Ok(())
    }

    pub fn rst(&mut self, local: SessionId, peer: &PeerSession) -> AndResult {
        let identity = *peer.identity();
        self.net.require_registered(&identity)?;
        let world = self
            .worlds
            .get_mut(&local)
            .ok_or_else(|| unknown_session(local))?;
        match world.member_state(&identity) {
            Some((_, sid)) if sid == peer.session_id => {}
            _ => {
                return Err(AndError::invalid(format!(
                    "RST from {} for an unknown peer session",
                    identity.short()
                )));
            }
        }
        self.net.drop_member(world, &identity);
        debug!("World {}: {} reset its session", local, identity.short());
        Ok(())
    }

    pub fn soa(&mut self, local: SessionId, peer: &PeerSession, objects: Vec<ObjectInfo>) -> AndResult {
        let identity = *peer.identity();
        self.net.require_registered(&identity)?;
        let world = joined_world(&mut self.worlds, local)?;
        world.require_established(peer)?;
        if objects.is_empty() {
            return Ok(());
        }

        let set = world.objects.entry(identity).or_default();
        for object in &objects {
            set.insert(object.id, object.address.clone());
        }
        self.net.emit(EngineEvent::ObjectAppend {
            local,
            peer: identity,
            objects,
        });
        Ok(())
    }

    pub fn sod(&mut self, local: SessionId, peer: &PeerSession, object_ids: Vec<ObjectId>) -> AndResult {
        let identity = *peer.identity();
        self.net.require_registered(&identity)?;
        let world = joined_world(&mut self.worlds, local)?;
        world.require_established(peer)?;

        let removed: Vec<ObjectId> = match world.objects.get_mut(&identity) {
            Some(set) => object_ids
                .into_iter()
                .filter(|id| set.remove(id).is_some())
                .collect(),
            None => Vec::new(),
        };
        if world.objects.get(&identity).is_some_and(|set| set.is_empty()) {
            world.objects.remove(&identity);
        }
        if !removed.is_empty() {
            self.net.emit(EngineEvent::ObjectDelete {
                local,
                peer: identity,
                object_ids: removed,
            });
        }
        Ok(())
    }

    // ==================== Timers ====================

    pub fn timer_expire(&mut self, local: SessionId) -> AndResult {
        let Some(world) = self.worlds.get_mut(&local) else {
            return Err(AndError::invalid(format!("timer for closed session {local}")));
        };

        if world.is_joined() {
            self.net.heartbeat(world);
            return Ok(());
        }
        let target = match &mut world.phase {
            WorldPhase::Joining { target, attempts, .. } => {
                // Only expiries without a connection to the target count. Once JN can be
                // delivered the join waits for the acceptor or the caller's deadline.
                if !self.net.is_connected(&target.identity) {
                    *attempts += 1;
                }
                (*attempts < self.net.config.max_join_attempts).then(|| target.clone())
            }
            WorldPhase::Joined => None,
        };

        let Some(target) = target else {
            self.fail_join(local, JOIN_TIMEOUT, "join timed out".to_string());
            return Ok(());
        };

        let resent = self.net.is_connected(&target.identity)
            && self.net.send(
                &target.identity,
                AhmpMessage::Jn {
                    text: target.path.clone(),
                    sender: local,
                },
            );
        if !resent {
            self.net.emit(EngineEvent::ConnectRequest { url: target });
        }
        if resent
            && let Some(world) = self.worlds.get_mut(&local)
            && let WorldPhase::Joining { sent, .. } = &mut world.phase
        {
            *sent = true;
        }
        self.net.emit(EngineEvent::TimerRequest {
            local,
            after: self.net.config.join_retry_interval,
        });
        Ok(())
    }

    // ==================== Introspection ====================

    pub fn members(&self, local: SessionId) -> Option<Vec<MemberSummary>> {
        let world = self.worlds.get(&local)?;
        let mut members: Vec<MemberSummary> = world
            .members
            .iter()
            .map(|(identity, m)| MemberSummary {
                identity: *identity,
                session_id: m.session_id,
                state: m.state,
            })
            .collect();
        members.sort_by(|a, b| a.identity.cmp(&b.identity));
        Some(members)
    }

    pub fn objects_of(&self, local: SessionId, peer: &IdentityHash) -> Vec<ObjectInfo> {
        let mut objects: Vec<ObjectInfo> = self
            .worlds
            .get(&local)
            .and_then(|w| w.objects.get(peer))
            .map(|set| {
                set.iter()
                    .map(|(id, address)| ObjectInfo::new(*id, address.clone()))
                    .collect()
            })
            .unwrap_or_default();
        objects.sort_by(|a, b| a.id.cmp(&b.id));
        objects
    }
}

fn established_session_of(world: &WorldSession, identity: &IdentityHash) -> Option<SessionId> {
    world
        .members
        .get(identity)
        .filter(|m| m.state == JoinState::Established)
        .map(|m| m.session_id)
}
