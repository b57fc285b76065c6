//! Read-only health and queue projections exposed to operator tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of scheduler queue occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub blocked: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStatus {
    pub fn depth(&self) -> usize {
        self.queued + self.blocked
    }
}

/// System-wide health report emitted by the heartbeat as
/// `core.health.report` and served by `system_health()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub queue: QueueStatus,
    /// Keys of breakers currently open.
    pub open_breakers: Vec<String>,
    /// Keys of breakers quarantined and waiting on operator action.
    pub quarantined_breakers: Vec<String>,
    /// Failure fraction over the recent trace window.
    pub recent_failure_rate: f64,
    /// Bytes used by the event store on disk.
    pub store_bytes: u64,
    /// True while the store is rejecting appends and the bus runs in-memory.
    pub storage_degraded: bool,
    /// Events dropped by bus backpressure since startup.
    pub events_dropped: u64,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        !self.storage_degraded
            && self.quarantined_breakers.is_empty()
            && self.recent_failure_rate < 0.5
    }
}
