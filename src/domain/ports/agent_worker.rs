//! Agent worker contract.
//!
//! The core never calls an LLM or external API itself. Executing a task on
//! an agent goes through this trait, implemented by an external collaborator.
//! The worker is trusted to honor cancellation within a bounded grace period;
//! if it does not, the dispatcher abandons the call and marks the task timed
//! out.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::models::{AgentConfig, Task, Trace};

/// Result of one agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Coarse error class supplied by the worker, e.g. `timeout` or
    /// `rate_limit`. Classified into a stable signature by the trace
    /// recorder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl ExecutionResult {
    pub fn ok(duration_ms: u64) -> Self {
        Self {
            success: true,
            duration_ms,
            output: None,
            error_kind: None,
            error_detail: None,
        }
    }

    pub fn failed(duration_ms: u64, kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            duration_ms,
            output: None,
            error_kind: Some(kind.into()),
            error_detail: Some(detail.into()),
        }
    }
}

/// Errors raised by the worker boundary itself (as opposed to a task that
/// ran and failed, which is an unsuccessful [`ExecutionResult`]).
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker does not support trace replay")]
    ReplayUnsupported,

    #[error("worker failure: {0}")]
    Failed(String),
}

/// Pluggable execution capability for agents.
#[async_trait]
pub trait AgentWorker: Send + Sync {
    /// Run one task attempt on the given agent snapshot. Cancellation is
    /// requested through the token; the call should return promptly after it
    /// fires.
    async fn execute(
        &self,
        agent: Arc<AgentConfig>,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, WorkerError>;

    /// Whether this worker can deterministically replay recorded traces for
    /// regression gating.
    fn supports_replay(&self) -> bool {
        false
    }

    /// Replay a past trace against a (possibly changed) agent config.
    async fn replay(
        &self,
        _agent: Arc<AgentConfig>,
        _trace: &Trace,
    ) -> Result<ExecutionResult, WorkerError> {
        Err(WorkerError::ReplayUnsupported)
    }
}
