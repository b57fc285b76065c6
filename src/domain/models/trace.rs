//! Trace domain model.
//!
//! A trace is the recorded outcome of one task attempt on one agent. Failed
//! attempts carry a stable error signature used by retry policy, circuit
//! breakers, analytics, and remediation.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use super::agent::{AgentId, Env};
use super::task::TaskId;

/// Unique identifier for a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(pub Uuid);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable classifier for a failure, shared across retries, breakers,
/// analytics, and remediation. Serialized as its wire string, e.g.
/// `runtime_error:ValueError`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorSignature {
    Timeout,
    ApiRateLimit,
    TransientError,
    WorkerLost,
    InvalidTaskSpec,
    UnknownAgent,
    PermissionDenied,
    Runtime(String),
    TestError,
    BreakerOpen,
    Quarantined,
    Other,
}

impl ErrorSignature {
    /// Transient signatures are retried by the scheduler up to the task's
    /// retry budget; everything else fails immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ApiRateLimit | Self::TransientError | Self::WorkerLost
        )
    }

    /// Runtime errors get a small retry cap regardless of the task budget.
    pub fn is_runtime(&self) -> bool {
        matches!(self, Self::Runtime(_))
    }

    pub fn wire(&self) -> String {
        match self {
            Self::Timeout => "timeout".to_string(),
            Self::ApiRateLimit => "api_rate_limit".to_string(),
            Self::TransientError => "transient_error".to_string(),
            Self::WorkerLost => "worker_lost".to_string(),
            Self::InvalidTaskSpec => "invalid_task_spec".to_string(),
            Self::UnknownAgent => "unknown_agent".to_string(),
            Self::PermissionDenied => "permission_denied".to_string(),
            Self::Runtime(kind) => format!("runtime_error:{kind}"),
            Self::TestError => "test_error".to_string(),
            Self::BreakerOpen => "breaker_open".to_string(),
            Self::Quarantined => "quarantined".to_string(),
            Self::Other => "other".to_string(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "timeout" => Self::Timeout,
            "api_rate_limit" => Self::ApiRateLimit,
            "transient_error" => Self::TransientError,
            "worker_lost" => Self::WorkerLost,
            "invalid_task_spec" => Self::InvalidTaskSpec,
            "unknown_agent" => Self::UnknownAgent,
            "permission_denied" => Self::PermissionDenied,
            "test_error" => Self::TestError,
            "breaker_open" => Self::BreakerOpen,
            "quarantined" => Self::Quarantined,
            other => match other.strip_prefix("runtime_error:") {
                Some(kind) if !kind.is_empty() => Self::Runtime(kind.to_string()),
                _ => Self::Other,
            },
        }
    }
}

impl std::fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.wire())
    }
}

impl Serialize for ErrorSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.wire())
    }
}

impl<'de> Deserialize<'de> for ErrorSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Err(D::Error::custom("empty error signature"));
        }
        Ok(Self::parse(&s))
    }
}

/// Routing and tooling context captured with a trace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceContext {
    /// How the agent was selected (explicit, exact, keyword, fallback).
    #[serde(default)]
    pub route: String,
    #[serde(default)]
    pub tools_used: Vec<String>,
}

/// One execution record for one task attempt on one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: TraceId,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub task_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: u64,
    /// Present iff `success == false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_signature: Option<ErrorSignature>,
    pub env: Env,
    #[serde(default)]
    pub context: TraceContext,
}
