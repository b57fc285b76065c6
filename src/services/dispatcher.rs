//! Task dispatch to the agent worker.
//!
//! The dispatcher is the only component that crosses the worker boundary.
//! Before the call it opens a trace and checks the circuit breaker, the
//! per-agent in-flight quota, and the provider rate limit; after the call it
//! closes the trace, updates stats via the recorder, and records the result
//! against the breaker. Worker exceptions are caught and classified — they
//! never propagate.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::domain::models::{AgentConfig, AgentId, ErrorSignature, Task, TraceId};
use crate::domain::ports::AgentWorker;
use crate::services::circuit_breaker::{BreakerKey, BreakerState, CircuitBreakers};
use crate::services::trace_recorder::{TraceRecorder, WorkerFailure};

/// Shared view of per-agent in-flight task counts. The dispatcher enforces
/// the quota; the router uses the same numbers for load-based tie breaks.
#[derive(Default)]
pub struct AgentLoadTable {
    counts: RwLock<HashMap<AgentId, Arc<AtomicU32>>>,
}

impl AgentLoadTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, id: &AgentId) -> Arc<AtomicU32> {
        if let Some(c) = self
            .counts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
        {
            return c.clone();
        }
        self.counts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone()
    }

    pub fn load(&self, id: &AgentId) -> u32 {
        self.counter(id).load(Ordering::SeqCst)
    }

    /// Take an in-flight slot if the quota allows; the guard releases it.
    fn acquire(&self, id: &AgentId, max_in_flight: u32) -> Option<LoadGuard> {
        let counter = self.counter(id);
        let acquired = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < max_in_flight).then_some(current + 1)
            })
            .is_ok();
        acquired.then_some(LoadGuard { counter })
    }
}

struct LoadGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Default requests-per-second per provider.
    pub provider_rps: u32,
    /// Per-provider overrides.
    pub provider_overrides: HashMap<String, u32>,
    /// How long a cancelled worker gets to wind down before the call is
    /// abandoned.
    pub cancel_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            provider_rps: 10,
            provider_overrides: HashMap::new(),
            cancel_grace: Duration::from_millis(500),
        }
    }
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub success: bool,
    /// The attempt was cancelled from outside (operator or shutdown), not
    /// failed on its own terms.
    pub cancelled: bool,
    pub signature: Option<ErrorSignature>,
    pub output: Option<Value>,
    pub trace_id: TraceId,
    pub duration_ms: u64,
}

/// Invokes the agent-worker boundary with tracing, breakers, and quotas.
pub struct Dispatcher {
    worker: Arc<dyn AgentWorker>,
    traces: Arc<TraceRecorder>,
    breakers: Arc<CircuitBreakers>,
    loads: Arc<AgentLoadTable>,
    /// Shared limiter for providers without an override.
    default_limiter: DefaultKeyedRateLimiter<String>,
    /// Dedicated limiters for providers with an explicit rate.
    override_limiters: HashMap<String, DefaultDirectRateLimiter>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        worker: Arc<dyn AgentWorker>,
        traces: Arc<TraceRecorder>,
        breakers: Arc<CircuitBreakers>,
        loads: Arc<AgentLoadTable>,
        config: DispatcherConfig,
    ) -> Self {
        let rps = NonZeroU32::new(config.provider_rps.max(1)).expect("max(1) is non-zero");
        let default_limiter = RateLimiter::keyed(Quota::per_second(rps));
        let override_limiters = config
            .provider_overrides
            .iter()
            .filter_map(|(provider, rps)| {
                let rps = NonZeroU32::new(*rps)?;
                Some((
                    provider.clone(),
                    RateLimiter::direct(Quota::per_second(rps)),
                ))
            })
            .collect();
        Self {
            worker,
            traces,
            breakers,
            loads,
            default_limiter,
            override_limiters,
            config,
        }
    }

    pub fn loads(&self) -> Arc<AgentLoadTable> {
        self.loads.clone()
    }

    pub fn worker(&self) -> Arc<dyn AgentWorker> {
        self.worker.clone()
    }

    async fn fail_before_call(
        &self,
        trace_id: TraceId,
        signature: ErrorSignature,
        detail: &str,
    ) -> DispatchOutcome {
        let _ = self
            .traces
            .end(
                trace_id,
                false,
                Some(WorkerFailure::new(signature.wire(), Some(detail.to_string()))),
            )
            .await;
        DispatchOutcome {
            success: false,
            cancelled: false,
            signature: Some(signature),
            output: None,
            trace_id,
            duration_ms: 0,
        }
    }

    /// Execute one attempt of `task` on `agent` under `timeout`.
    #[instrument(skip(self, task, agent, cancel), fields(task = %task.id, agent = %agent.id))]
    pub async fn dispatch(
        &self,
        task: &Task,
        agent: Arc<AgentConfig>,
        route: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> DispatchOutcome {
        let breaker_key = BreakerKey::agent_task(agent.id.clone(), task.task_type.clone());
        let trace_id = self.traces.start(task, &agent, route).await;

        // Breaker check. The router normally filters open breakers, but the
        // dispatcher is the last line: explicit assignments land here too.
        if !self.breakers.should_execute(&breaker_key).await {
            let signature = match self.breakers.state(&breaker_key).await {
                BreakerState::Quarantined => ErrorSignature::Quarantined,
                _ => ErrorSignature::BreakerOpen,
            };
            debug!(agent = %agent.id, "dispatch blocked by breaker");
            return self.fail_before_call(trace_id, signature, "circuit breaker").await;
        }

        // Per-agent in-flight quota.
        let Some(_load_guard) = self.loads.acquire(&agent.id, agent.max_in_flight) else {
            return self
                .fail_before_call(
                    trace_id,
                    ErrorSignature::ApiRateLimit,
                    "agent in-flight quota exceeded",
                )
                .await;
        };

        // Provider rate limit.
        if self.rate_limit_exceeded(&agent.provider) {
            return self
                .fail_before_call(
                    trace_id,
                    ErrorSignature::ApiRateLimit,
                    "provider rate limit",
                )
                .await;
        }

        let child = cancel.child_token();
        let call = self.worker.execute(agent.clone(), task, child.clone());
        tokio::pin!(call);

        let result = tokio::select! {
            res = &mut call => Some(res),
            () = tokio::time::sleep(timeout) => None,
        };

        let result = match result {
            Some(result) => result,
            None => {
                // Watchdog fired: cancel and give the worker a bounded grace
                // period to wind down, then abandon the call.
                child.cancel();
                let _ = tokio::time::timeout(self.config.cancel_grace, &mut call).await;
                let _ = self
                    .traces
                    .end(
                        trace_id,
                        false,
                        Some(WorkerFailure::new("timeout", Some(format!(
                            "exceeded {}ms",
                            timeout.as_millis()
                        )))),
                    )
                    .await;
                self.breakers
                    .record_failure(&breaker_key, &ErrorSignature::Timeout)
                    .await;
                return DispatchOutcome {
                    success: false,
                    cancelled: false,
                    signature: Some(ErrorSignature::Timeout),
                    output: None,
                    trace_id,
                    duration_ms: timeout.as_millis() as u64,
                };
            }
        };

        if cancel.is_cancelled() {
            let _ = self
                .traces
                .end(
                    trace_id,
                    false,
                    Some(WorkerFailure::new("cancelled", None)),
                )
                .await;
            return DispatchOutcome {
                success: false,
                cancelled: true,
                signature: None,
                output: None,
                trace_id,
                duration_ms: 0,
            };
        }

        match result {
            Ok(exec) if exec.success => {
                let trace = self.traces.end(trace_id, true, None).await.ok();
                self.breakers.record_success(&breaker_key).await;
                DispatchOutcome {
                    success: true,
                    cancelled: false,
                    signature: None,
                    output: exec.output,
                    trace_id,
                    duration_ms: trace.map_or(exec.duration_ms, |t| t.duration_ms),
                }
            }
            Ok(exec) => {
                let failure = WorkerFailure::new(
                    exec.error_kind.unwrap_or_else(|| "other".to_string()),
                    exec.error_detail,
                );
                let trace = self.traces.end(trace_id, false, Some(failure)).await.ok();
                let signature = trace
                    .as_ref()
                    .and_then(|t| t.error_signature.clone())
                    .unwrap_or(ErrorSignature::Other);
                self.breakers.record_failure(&breaker_key, &signature).await;
                DispatchOutcome {
                    success: false,
                    cancelled: false,
                    signature: Some(signature),
                    output: exec.output,
                    trace_id,
                    duration_ms: trace.map_or(0, |t| t.duration_ms),
                }
            }
            Err(e) => {
                // Worker boundary exception: caught and classified, never
                // propagated.
                warn!(error = %e, "agent worker raised");
                let failure =
                    WorkerFailure::new("runtime_error:WorkerError", Some(e.to_string()));
                let trace = self.traces.end(trace_id, false, Some(failure)).await.ok();
                let signature = trace
                    .as_ref()
                    .and_then(|t| t.error_signature.clone())
                    .unwrap_or(ErrorSignature::Other);
                self.breakers.record_failure(&breaker_key, &signature).await;
                DispatchOutcome {
                    success: false,
                    cancelled: false,
                    signature: Some(signature),
                    output: None,
                    trace_id,
                    duration_ms: trace.map_or(0, |t| t.duration_ms),
                }
            }
        }
    }

    fn rate_limit_exceeded(&self, provider: &str) -> bool {
        // An override of 0 blocks the provider outright.
        if self.config.provider_overrides.get(provider) == Some(&0) {
            return true;
        }
        match self.override_limiters.get(provider) {
            Some(limiter) => limiter.check().is_err(),
            None => self.default_limiter.check_key(&provider.to_string()).is_err(),
        }
    }
}
