//! Host configuration loading.

use std::path::Path;
use std::time::Duration;

use and_core::EngineConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Address the WebSocket transport listens on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Deadline for `join_world` when the caller gives none, in milliseconds
    #[serde(default = "default_join_timeout_ms")]
    pub default_join_timeout_ms: u64,

    /// Host errors kept for `pop_error` before new ones are dropped
    #[serde(default = "default_error_queue_capacity")]
    pub error_queue_capacity: usize,

    /// Engine timing
    #[serde(default)]
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_join_retry_interval_ms")]
    pub join_retry_interval_ms: u64,

    #[serde(default = "default_max_join_attempts")]
    pub max_join_attempts: u32,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Member snapshot every N heartbeats
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,

    #[serde(default = "default_stale_handshake_ticks")]
    pub stale_handshake_ticks: u64,

    #[serde(default = "default_true")]
    pub verify_after_mutation: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            join_retry_interval_ms: default_join_retry_interval_ms(),
            max_join_attempts: default_max_join_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            snapshot_every: default_snapshot_every(),
            stale_handshake_ticks: default_stale_handshake_ticks(),
            verify_after_mutation: true,
        }
    }
}

impl EngineSettings {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            join_retry_interval: Duration::from_millis(self.join_retry_interval_ms),
            max_join_attempts: self.max_join_attempts,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            snapshot_every: self.snapshot_every,
            stale_handshake_ticks: self.stale_handshake_ticks,
            verify_after_mutation: self.verify_after_mutation,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:9427".to_string()
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

fn default_error_queue_capacity() -> usize {
    32
}

fn default_join_retry_interval_ms() -> u64 {
    1000
}

fn default_max_join_attempts() -> u32 {
    5
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_snapshot_every() -> u64 {
    3
}

fn default_stale_handshake_ticks() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            default_join_timeout_ms: default_join_timeout_ms(),
            error_queue_capacity: default_error_queue_capacity(),
            engine: EngineSettings::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from a JSON file, or defaults if it doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            let config: HostConfig = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", path);
            Ok(HostConfig::default())
        }
    }

    pub fn default_join_timeout(&self) -> Duration {
        Duration::from_millis(self.default_join_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.error_queue_capacity, 32);
        assert_eq!(config.default_join_timeout(), Duration::from_secs(10));
        assert_eq!(config.engine.to_engine_config(), EngineConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: HostConfig =
            serde_json::from_str(r#"{"listen":"0.0.0.0:1","engine":{"snapshot_every":7}}"#).unwrap();
        assert_eq!(config.listen, "0.0.0.0:1");
        assert_eq!(config.engine.snapshot_every, 7);
        assert_eq!(config.engine.max_join_attempts, 5);
        assert_eq!(config.error_queue_capacity, 32);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"default_join_timeout_ms":250}"#).unwrap();

        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.default_join_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9427");
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(HostConfig::load(&path).is_err());
    }
}
