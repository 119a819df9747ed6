//! Mapping from world paths to local sessions.
//!
//! Incoming join requests name a world by path. The host asks its resolver
//! which local session, if any, serves that path for the requesting peer.

use and_core::{IdentityHash, SessionId};
use std::collections::HashMap;
use std::sync::RwLock;

pub trait PathResolver: Send + Sync {
    /// The local session serving `path` to `requester`, if any.
    fn resolve(&self, path: &str, requester: &IdentityHash) -> Option<SessionId>;
}

/// Static path table shared by every requester.
#[derive(Debug, Default)]
pub struct SimplePathResolver {
    mappings: RwLock<HashMap<String, SessionId>>,
}

impl SimplePathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `path` to `session`. Returns the session previously mapped there.
    pub fn set_mapping(&self, path: &str, session: SessionId) -> Option<SessionId> {
        self.mappings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize(path), session)
    }

    pub fn delete_mapping(&self, path: &str) -> Option<SessionId> {
        self.mappings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&normalize(path))
    }

    pub fn len(&self) -> usize {
        self.mappings.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PathResolver for SimplePathResolver {
    fn resolve(&self, path: &str, _requester: &IdentityHash) -> Option<SessionId> {
        self.mappings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&normalize(path))
            .copied()
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requester() -> IdentityHash {
        IdentityHash::of_certificate(b"requester")
    }

    #[test]
    fn test_resolve_mapped_path() {
        let resolver = SimplePathResolver::new();
        let session = SessionId::generate();
        assert_eq!(resolver.set_mapping("lobby", session), None);

        assert_eq!(resolver.resolve("lobby", &requester()), Some(session));
        assert_eq!(resolver.resolve("/lobby", &requester()), Some(session));
        assert_eq!(resolver.resolve("other", &requester()), None);
    }

    #[test]
    fn test_remap_returns_previous() {
        let resolver = SimplePathResolver::new();
        let first = SessionId::generate();
        let second = SessionId::generate();
        resolver.set_mapping("lobby", first);

        assert_eq!(resolver.set_mapping("/lobby", second), Some(first));
        assert_eq!(resolver.resolve("lobby", &requester()), Some(second));
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn test_delete_mapping() {
        let resolver = SimplePathResolver::new();
        let session = SessionId::generate();
        resolver.set_mapping("lobby", session);

        assert_eq!(resolver.delete_mapping("lobby"), Some(session));
        assert_eq!(resolver.delete_mapping("lobby"), None);
        assert!(resolver.is_empty());
    }
}
