//! Engine tuning knobs.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Delay between JN retries while a join is pending.
    pub join_retry_interval: Duration,
    /// A join fails with `JOIN_TIMEOUT` after this many unanswered retries.
    pub max_join_attempts: u32,
    /// Heartbeat period for joined worlds.
    pub heartbeat_interval: Duration,
    /// Send a member snapshot (SNB) every N heartbeats.
    pub snapshot_every: u64,
    /// Drop unconfirmed member entries after this many heartbeats.
    pub stale_handshake_ticks: u64,
    /// Run the sanity check after every mutating call.
    pub verify_after_mutation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            join_retry_interval: Duration::from_secs(1),
            max_join_attempts: 5,
            heartbeat_interval: Duration::from_secs(1),
            snapshot_every: 3,
            stale_handshake_ticks: 5,
            verify_after_mutation: true,
        }
    }
}
