//! Event domain model.
//!
//! Events are the single substrate every component communicates through:
//! immutable, ordered records identified by a hierarchical dotted type name.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::agent::AgentId;
use super::task::TaskId;
use super::trace::TraceId;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error produced when an event type or pattern fails validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventTypeError {
    #[error("event type must be a non-empty dotted identifier, got {0:?}")]
    InvalidType(String),

    #[error("invalid pattern segment {0:?}: `*` must be a whole segment")]
    InvalidPattern(String),
}

/// Hierarchical dotted event type name, e.g. `agent.task.failed`.
///
/// Validated at construction: non-empty segments of `[a-z0-9_-]` separated
/// by single dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn parse(s: impl Into<String>) -> Result<Self, EventTypeError> {
        let s = s.into();
        let valid = !s.is_empty()
            && s.split('.').all(|seg| {
                !seg.is_empty()
                    && seg
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
            });
        if valid {
            Ok(Self(s))
        } else {
            Err(EventTypeError::InvalidType(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    Wildcard,
}

/// Subscription pattern over event types.
///
/// Literal segments match exactly. A `*` segment in the middle of a pattern
/// matches exactly one segment; a trailing `*` matches one or more remaining
/// segments, so `agent.*` matches `agent.task.started` but not `agent`.
/// The bare pattern `*` matches every event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPattern {
    raw: String,
    segments: Vec<PatternSegment>,
}

impl EventPattern {
    pub fn parse(pattern: &str) -> Result<Self, EventTypeError> {
        if pattern.is_empty() {
            return Err(EventTypeError::InvalidPattern(pattern.to_string()));
        }
        let mut segments = Vec::new();
        for seg in pattern.split('.') {
            if seg == "*" {
                segments.push(PatternSegment::Wildcard);
            } else if !seg.is_empty() && !seg.contains('*') {
                segments.push(PatternSegment::Literal(seg.to_string()));
            } else {
                return Err(EventTypeError::InvalidPattern(pattern.to_string()));
            }
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check whether an event type matches this pattern.
    pub fn matches(&self, event_type: &EventType) -> bool {
        let segs: Vec<&str> = event_type.segments().collect();
        let n = self.segments.len();

        let trailing_wildcard = matches!(self.segments.last(), Some(PatternSegment::Wildcard));
        if trailing_wildcard {
            // Trailing `*` consumes one-or-more remaining segments.
            if segs.len() < n {
                return false;
            }
            self.segments[..n - 1]
                .iter()
                .zip(segs.iter())
                .all(|(p, s)| match p {
                    PatternSegment::Literal(l) => l == s,
                    PatternSegment::Wildcard => true,
                })
        } else {
            if segs.len() != n {
                return false;
            }
            self.segments.iter().zip(segs.iter()).all(|(p, s)| match p {
                PatternSegment::Literal(l) => l == s,
                PatternSegment::Wildcard => true,
            })
        }
    }
}

impl std::fmt::Display for EventPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Immutable event record.
///
/// Constructed by components with a builder-style API; the EventBus stamps
/// the timestamp on emit and persists the record before fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source: String,
    pub timestamp_ms: i64,
    pub severity: EventSeverity,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    /// Durable events must be flushed to the store before the emitter proceeds.
    #[serde(default)]
    pub durable: bool,
}

impl Event {
    /// Create a new event. Durability defaults from severity: warnings and
    /// above are durable, informational telemetry is best-effort.
    pub fn new(event_type: EventType, source: impl Into<String>, severity: EventSeverity) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            source: source.into(),
            timestamp_ms: 0,
            severity,
            payload: Map::new(),
            task_id: None,
            agent_id: None,
            trace_id: None,
            durable: severity >= EventSeverity::Warning,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Depth of the deepest nested value in the payload.
    pub fn payload_depth(&self) -> usize {
        fn depth(v: &Value) -> usize {
            match v {
                Value::Object(m) => 1 + m.values().map(depth).max().unwrap_or(0),
                Value::Array(a) => 1 + a.iter().map(depth).max().unwrap_or(0),
                _ => 0,
            }
        }
        1 + self.payload.values().map(depth).max().unwrap_or(0)
    }
}

/// Well-known event type names emitted by the core.
pub mod event_types {
    pub const TASK_SUBMITTED: &str = "task.submitted";
    pub const TASK_QUEUED: &str = "task.queued";
    pub const TASK_BLOCKED: &str = "task.blocked";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_SUCCEEDED: &str = "task.succeeded";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_REJECTED: &str = "task.rejected";

    pub const AGENT_TASK_SUCCEEDED: &str = "agent.task.succeeded";
    pub const AGENT_TASK_FAILED: &str = "agent.task.failed";
    pub const AGENT_CONFIG_UPDATED: &str = "agent.config.updated";

    pub const SCHEDULER_RETRY_SCHEDULED: &str = "scheduler.retry_scheduled";

    pub const BREAKER_OPENED: &str = "breaker.opened";
    pub const BREAKER_CLOSED: &str = "breaker.closed";
    pub const BREAKER_HALF_OPEN_PROBE: &str = "breaker.half_open_probe";
    pub const BREAKER_QUARANTINED: &str = "breaker.quarantined";

    pub const REACTOR_SUCCESS: &str = "reactor.success";
    pub const REACTOR_FAILED: &str = "reactor.failed";
    pub const REACTOR_COOLDOWN_SKIPPED: &str = "reactor.cooldown_skipped";
    pub const REACTOR_PENDING_CONFIRM: &str = "reactor.pending_confirm";

    pub const PROPOSAL_CREATED: &str = "proposal.created";
    pub const PROPOSAL_APPLIED: &str = "proposal.applied";
    pub const PROPOSAL_REJECTED: &str = "proposal.rejected";
    pub const PROPOSAL_REVERTED: &str = "proposal.reverted";

    pub const ROLLBACK_EXECUTED: &str = "rollback.executed";

    pub const CORE_HEALTH_REPORT: &str = "core.health.report";
    pub const CORE_WORKER_LOST: &str = "core.worker.lost";
    pub const CORE_STORAGE_DEGRADED: &str = "core.storage.degraded";
    pub const CORE_STORAGE_REPAIRED: &str = "core.storage.repaired";
    pub const CORE_SUBSCRIBER_ERROR: &str = "core.subscriber.error";
    pub const CORE_PLAYBOOKS_CHANGED: &str = "core.playbooks.changed";
}
