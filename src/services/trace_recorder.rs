//! Per-attempt execution traces.
//!
//! `start` opens a pending trace when the dispatcher hands a task to an
//! agent; `end` computes the duration, classifies the failure into a stable
//! signature, persists the trace, updates agent stats, and emits the outcome
//! event. Recent traces stay in memory for the scheduler's adaptive timeouts
//! and the self-improving loop's analysis window.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::domain::models::event::event_types;
use crate::domain::models::{
    AgentConfig, AgentId, Env, ErrorSignature, EventSeverity, MetricsSnapshot, Task, Trace,
    TraceContext, TraceId,
};
use crate::domain::ports::Clock;
use crate::services::agent_registry::AgentRegistry;
use crate::services::event_bus::{core_event, EventBus};
use crate::services::event_store::{EventStore, Stream, StoreError};

/// Error class reported by the worker boundary, before classification.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    pub kind: String,
    pub detail: Option<String>,
}

impl WorkerFailure {
    pub fn new(kind: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            detail,
        }
    }
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("unknown trace id: {0}")]
    UnknownTrace(TraceId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
struct PendingTrace {
    trace_id: TraceId,
    agent_id: AgentId,
    task_id: crate::domain::models::TaskId,
    task_type: String,
    started_at: DateTime<Utc>,
    env: Env,
    context: TraceContext,
}

/// Records one trace per task attempt and serves windowed queries over
/// recent history.
pub struct TraceRecorder {
    pending: Mutex<HashMap<TraceId, PendingTrace>>,
    recent: RwLock<VecDeque<Arc<Trace>>>,
    capacity: usize,
    store: Arc<EventStore>,
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl TraceRecorder {
    pub fn new(
        store: Arc<EventStore>,
        registry: Arc<AgentRegistry>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            recent: RwLock::new(VecDeque::new()),
            capacity: 10_000,
            store,
            registry,
            bus,
            clock,
        }
    }

    /// Reload recent traces from the store into the in-memory window.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let records = self.store.read::<Trace>(Stream::Traces, 0)?;
        let count = records.len();
        let mut recent = self.recent.write().await;
        for stored in records {
            recent.push_back(Arc::new(stored.record));
            while recent.len() > self.capacity {
                recent.pop_front();
            }
        }
        Ok(count)
    }

    /// Open a trace for one attempt of `task` on `agent`.
    pub async fn start(&self, task: &Task, agent: &AgentConfig, route: &str) -> TraceId {
        let trace_id = TraceId::new();
        let pending = PendingTrace {
            trace_id,
            agent_id: agent.id.clone(),
            task_id: task.id,
            task_type: task.task_type.clone(),
            started_at: self.clock.now(),
            env: agent.env,
            context: TraceContext {
                route: route.to_string(),
                tools_used: agent.tool_permissions.clone(),
            },
        };
        self.pending.lock().await.insert(trace_id, pending);
        trace_id
    }

    /// Classify a worker-reported failure into a stable signature.
    ///
    /// Test-env traces classify to `test_error` unless a transient rule
    /// matches first, so retry behavior stays identical across envs while
    /// test noise stays out of prod analytics. `Other` only after every rule
    /// fails.
    pub fn classify(failure: &WorkerFailure, env: Env) -> ErrorSignature {
        let kind = failure.kind.to_lowercase();
        // Transient and policy signatures keep their identity in every env
        // so retry, breaker, and router behavior stays uniform.
        let uniform = match kind.as_str() {
            "timeout" | "deadline_exceeded" => Some(ErrorSignature::Timeout),
            "api_rate_limit" | "rate_limit" | "rate_limited" | "429" => {
                Some(ErrorSignature::ApiRateLimit)
            }
            "transient" | "transient_error" | "connection_reset" | "unavailable" => {
                Some(ErrorSignature::TransientError)
            }
            "worker_lost" => Some(ErrorSignature::WorkerLost),
            "breaker_open" => Some(ErrorSignature::BreakerOpen),
            "quarantined" => Some(ErrorSignature::Quarantined),
            _ => None,
        };
        if let Some(sig) = uniform {
            return sig;
        }
        if env == Env::Test {
            return ErrorSignature::TestError;
        }
        match kind.as_str() {
            "permission_denied" | "forbidden" | "unauthorized" => ErrorSignature::PermissionDenied,
            "invalid_task_spec" | "invalid_spec" => ErrorSignature::InvalidTaskSpec,
            "unknown_agent" => ErrorSignature::UnknownAgent,
            _ => {
                if let Some(name) = kind.strip_prefix("runtime_error:") {
                    if !name.is_empty() {
                        return ErrorSignature::Runtime(name.to_string());
                    }
                }
                if kind == "runtime_error" || kind == "exception" {
                    let name = failure
                        .detail
                        .as_deref()
                        .and_then(|d| d.split([':', ' ']).next())
                        .filter(|s| !s.is_empty())
                        .unwrap_or("Unknown");
                    return ErrorSignature::Runtime(name.to_string());
                }
                ErrorSignature::Other
            }
        }
    }

    /// Close a trace: persist, update stats, and emit the outcome event.
    #[instrument(skip(self, failure), fields(trace = %trace_id))]
    pub async fn end(
        &self,
        trace_id: TraceId,
        success: bool,
        failure: Option<WorkerFailure>,
    ) -> Result<Arc<Trace>, TraceError> {
        let pending = self
            .pending
            .lock()
            .await
            .remove(&trace_id)
            .ok_or(TraceError::UnknownTrace(trace_id))?;

        let ended_at = self.clock.now();
        let duration_ms = (ended_at - pending.started_at).num_milliseconds().max(0) as u64;
        let error_signature = if success {
            None
        } else {
            Some(
                failure
                    .as_ref()
                    .map(|f| Self::classify(f, pending.env))
                    .unwrap_or(ErrorSignature::Other),
            )
        };

        let trace = Arc::new(Trace {
            trace_id,
            agent_id: pending.agent_id.clone(),
            task_id: pending.task_id,
            task_type: pending.task_type,
            started_at: pending.started_at,
            ended_at,
            success,
            duration_ms,
            error_signature: error_signature.clone(),
            env: pending.env,
            context: pending.context,
        });

        self.store
            .append(Stream::Traces, trace.as_ref(), !success)
            .await?;

        {
            let mut recent = self.recent.write().await;
            recent.push_back(trace.clone());
            while recent.len() > self.capacity {
                recent.pop_front();
            }
        }

        if let Some(stats) = self.registry.stats_for(&pending.agent_id).await {
            if success {
                stats.record_success(duration_ms);
            } else {
                stats.record_failure(duration_ms, self.clock.now_ms());
            }
        }

        let (event_type, severity) = if success {
            (event_types::AGENT_TASK_SUCCEEDED, EventSeverity::Info)
        } else {
            (event_types::AGENT_TASK_FAILED, EventSeverity::Error)
        };
        let mut event = core_event(event_type, "trace_recorder", severity)
            .with_task(pending.task_id)
            .with_agent(pending.agent_id)
            .with_trace(trace_id)
            .with_field("duration_ms", duration_ms)
            .with_field("env", pending.env.as_str());
        if let Some(sig) = &error_signature {
            event = event.with_field("error_signature", sig.wire());
        }
        let _ = self.bus.emit(event).await;

        Ok(trace)
    }

    /// Traces for one agent newer than `since_ms`, optionally filtered by env.
    pub async fn for_agent_since(
        &self,
        agent_id: &AgentId,
        since_ms: i64,
        env: Option<Env>,
    ) -> Vec<Arc<Trace>> {
        self.recent
            .read()
            .await
            .iter()
            .filter(|t| {
                t.agent_id == *agent_id
                    && t.ended_at.timestamp_millis() >= since_ms
                    && env.is_none_or(|e| t.env == e)
            })
            .cloned()
            .collect()
    }

    /// Durations of the last `limit` successful traces for one
    /// (agent, task type) pair, newest last.
    pub async fn successful_durations(
        &self,
        agent_id: &AgentId,
        task_type: &str,
        limit: usize,
    ) -> Vec<u64> {
        let recent = self.recent.read().await;
        let mut out: Vec<u64> = recent
            .iter()
            .rev()
            .filter(|t| t.success && t.agent_id == *agent_id && t.task_type == task_type)
            .take(limit)
            .map(|t| t.duration_ms)
            .collect();
        out.reverse();
        out
    }

    /// Aggregate metrics for one agent over traces newer than `since_ms`
    /// (prod env only, the improvement and rollback paths never consume test
    /// noise).
    pub async fn metrics_since(&self, agent_id: &AgentId, since_ms: i64) -> MetricsSnapshot {
        let traces = self.for_agent_since(agent_id, since_ms, Some(Env::Prod)).await;
        let sample_count = traces.len();
        if sample_count == 0 {
            return MetricsSnapshot::default();
        }
        let successes = traces.iter().filter(|t| t.success).count();
        let total_duration: u64 = traces.iter().map(|t| t.duration_ms).sum();
        MetricsSnapshot {
            success_rate: successes as f64 / sample_count as f64,
            avg_duration_ms: total_duration as f64 / sample_count as f64,
            sample_count,
        }
    }

    /// Failure fraction across all agents over the trailing window.
    pub async fn recent_failure_rate(&self, window_ms: i64) -> f64 {
        let cutoff = self.clock.now_ms() - window_ms;
        let recent = self.recent.read().await;
        let mut total = 0usize;
        let mut failed = 0usize;
        for trace in recent.iter().rev() {
            if trace.ended_at.timestamp_millis() < cutoff {
                break;
            }
            total += 1;
            if !trace.success {
                failed += 1;
            }
        }
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }

    pub async fn count(&self) -> usize {
        self.recent.read().await.len()
    }

    /// Seed a completed trace directly. Test/analysis hook used to replay
    /// historical windows without running tasks.
    pub async fn ingest(&self, trace: Trace) -> Result<(), StoreError> {
        self.store.append(Stream::Traces, &trace, false).await?;
        let mut recent = self.recent.write().await;
        recent.push_back(Arc::new(trace));
        while recent.len() > self.capacity {
            recent.pop_front();
        }
        Ok(())
    }
}
