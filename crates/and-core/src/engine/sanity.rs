//! Structural invariants over the engine state.
//!
//! A failure here means the engine is corrupted; the caller treats it as fatal.

use super::state::{EngineState, JoinState, WorldPhase};
use crate::ids::{IdentityHash, SessionId};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SanityError {
    #[error("world keyed {key} records session {recorded}")]
    MismatchedWorldKey { key: SessionId, recorded: SessionId },

    #[error("retired session {0} is still open")]
    RetiredSessionOpen(SessionId),

    #[error("world {0} lists the local node as a member")]
    SelfMember(SessionId),

    #[error("world {world} keys member {key} under identity {actual}")]
    MismatchedMemberKey {
        world: SessionId,
        key: IdentityHash,
        actual: IdentityHash,
    },

    #[error("world {world} member {member} is {state:?} without a connection")]
    DisconnectedMember {
        world: SessionId,
        member: IdentityHash,
        state: JoinState,
    },

    #[error("joining world {0} already has members or objects")]
    JoiningWithMembers(SessionId),

    #[error("joining world {0} targets the local node")]
    JoiningThroughSelf(SessionId),

    #[error("world {world} holds objects for non-established peer {peer}")]
    OrphanedObjects { world: SessionId, peer: IdentityHash },

    #[error("world {world} keeps an empty object set for {peer}")]
    EmptyObjectSet { world: SessionId, peer: IdentityHash },

    #[error("connection table keys {key} under identity {actual}")]
    MismatchedPeerKey {
        key: IdentityHash,
        actual: IdentityHash,
    },
}

impl EngineState {
    pub(crate) fn check(&self) -> Result<(), SanityError> {
        for (key, peer) in &self.net.peers {
            if peer.identity() != key {
                return Err(SanityError::MismatchedPeerKey {
                    key: *key,
                    actual: *peer.identity(),
                });
            }
        }

        for (key, world) in &self.worlds {
            if world.local != *key {
                return Err(SanityError::MismatchedWorldKey {
                    key: *key,
                    recorded: world.local,
                });
            }
            if self.retired.contains(key) {
                return Err(SanityError::RetiredSessionOpen(*key));
            }

            if let WorldPhase::Joining { target, .. } = &world.phase {
                if target.identity == self.net.local {
                    return Err(SanityError::JoiningThroughSelf(*key));
                }
                if !world.members.is_empty() || !world.objects.is_empty() {
                    return Err(SanityError::JoiningWithMembers(*key));
                }
                continue;
            }

            // Members are keyed by identity, so an (identity, peer session) pair appears at most once.
            for (identity, member) in &world.members {
                if *identity == self.net.local {
                    return Err(SanityError::SelfMember(*key));
                }
                if member.url.identity != *identity {
                    return Err(SanityError::MismatchedMemberKey {
                        world: *key,
                        key: *identity,
                        actual: member.url.identity,
                    });
                }
                let needs_connection = matches!(
                    member.state,
                    JoinState::Requested | JoinState::Established
                );
                if needs_connection && !self.net.peers.contains_key(identity) {
                    return Err(SanityError::DisconnectedMember {
                        world: *key,
                        member: *identity,
                        state: member.state,
                    });
                }
            }

            for (peer, set) in &world.objects {
                let established = world
                    .members
                    .get(peer)
                    .is_some_and(|m| m.state == JoinState::Established);
                if !established {
                    return Err(SanityError::OrphanedObjects {
                        world: *key,
                        peer: *peer,
                    });
                }
                if set.is_empty() {
                    return Err(SanityError::EmptyObjectSet {
                        world: *key,
                        peer: *peer,
                    });
                }
            }
        }
        Ok(())
    }
}
