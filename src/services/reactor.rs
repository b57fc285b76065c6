//! Playbook-driven remediation.
//!
//! The reactor subscribes to alert, failure, resource, and config-change
//! events. Each matching playbook runs its actions sequentially through
//! registered handlers (with per-action timeouts), then verifies the fix
//! against a metric bound; a failed verify or action error triggers the
//! playbook's rollback actions. Multiple playbooks matched by one event run
//! in parallel; each playbook is additionally guarded by a cooldown and its
//! own circuit breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::domain::models::event::event_types;
use crate::domain::models::{
    ActionDescriptor, ActionKind, ErrorSignature, Event, EventSeverity, Playbook, PlaybookId,
    VerifySpec,
};
use crate::domain::ports::{ActionContext, ActionHandler, Clock, MetricProbe};
use crate::services::circuit_breaker::{BreakerKey, CircuitBreakers};
use crate::services::event_bus::{core_event, EventBus, EventSubscriber};
use crate::services::event_store::{EventStore, Stream};
use crate::services::playbook_library::PlaybookLibrary;

/// Reactor tuning knobs.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Timeout for one action when the descriptor has none.
    pub default_action_timeout: Duration,
    /// Interval between verify-metric polls.
    pub verify_poll: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            default_action_timeout: Duration::from_secs(30),
            verify_poll: Duration::from_millis(500),
        }
    }
}

/// Runtime counters for one playbook.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybookStats {
    pub last_executed_ms: Option<i64>,
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

/// Journal record appended per execution to the `playbook_exec` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExecutionRecord {
    playbook_id: PlaybookId,
    trigger_event: String,
    started_ms: i64,
    outcome: String,
    actions_run: usize,
    detail: Option<String>,
}

/// Matches events against the playbook library and executes remediations.
pub struct Reactor {
    library: Arc<PlaybookLibrary>,
    breakers: Arc<CircuitBreakers>,
    handlers: RwLock<HashMap<ActionKind, Arc<dyn ActionHandler>>>,
    probe: Arc<dyn MetricProbe>,
    bus: Arc<EventBus>,
    store: Arc<EventStore>,
    clock: Arc<dyn Clock>,
    config: ReactorConfig,
    stats: Mutex<HashMap<PlaybookId, PlaybookStats>>,
}

/// Event patterns the reactor listens on.
pub const REACTOR_PATTERNS: [&str; 4] = [
    "alert.*",
    "agent.task.failed",
    "resource.*",
    "agent.config.updated",
];

impl Reactor {
    pub fn new(
        library: Arc<PlaybookLibrary>,
        breakers: Arc<CircuitBreakers>,
        probe: Arc<dyn MetricProbe>,
        bus: Arc<EventBus>,
        store: Arc<EventStore>,
        clock: Arc<dyn Clock>,
        config: ReactorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            library,
            breakers,
            handlers: RwLock::new(HashMap::new()),
            probe,
            bus,
            store,
            clock,
            config,
            stats: Mutex::new(HashMap::new()),
        })
    }

    /// Register the handler serving one action kind.
    pub async fn register_handler(
        &self,
        kind: ActionKind,
        handler: Arc<dyn ActionHandler>,
    ) {
        self.handlers.write().await.insert(kind, handler);
    }

    /// Subscribe this reactor on the bus for all reactor patterns.
    pub async fn attach(self: &Arc<Self>) {
        for pattern in REACTOR_PATTERNS {
            let subscriber = Arc::new(ReactorSubscriber {
                reactor: self.clone(),
            });
            if let Err(e) = self.bus.subscribe(pattern, subscriber).await {
                warn!(pattern, error = %e, "failed to subscribe reactor");
            }
        }
    }

    pub async fn stats_for(&self, id: &PlaybookId) -> PlaybookStats {
        self.stats.lock().await.get(id).copied().unwrap_or_default()
    }

    /// Dispatch one event: match playbooks and execute them in parallel.
    pub async fn on_event(self: &Arc<Self>, event: &Event) {
        let matched = self.library.match_event(event).await;
        if matched.is_empty() {
            return;
        }
        let mut joins = Vec::with_capacity(matched.len());
        for playbook in matched {
            let reactor = self.clone();
            let event = event.clone();
            joins.push(tokio::spawn(async move {
                reactor.execute_playbook(playbook, event).await;
            }));
        }
        for join in joins {
            let _ = join.await;
        }
    }

    #[instrument(skip(self, playbook, event), fields(playbook = %playbook.id, event = %event.event_type))]
    async fn execute_playbook(self: Arc<Self>, playbook: Arc<Playbook>, event: Event) {
        let now = self.clock.now_ms();

        // Cooldown between successive executions of the same playbook.
        {
            let stats = self.stats.lock().await;
            let last = stats.get(&playbook.id).and_then(|s| s.last_executed_ms);
            if let Some(last) = last {
                if playbook.cooldown_ms > 0 && (now - last) < playbook.cooldown_ms as i64 {
                    debug!(playbook = %playbook.id, "within cooldown, skipping");
                    let skip = core_event(
                        event_types::REACTOR_COOLDOWN_SKIPPED,
                        "reactor",
                        EventSeverity::Info,
                    )
                    .with_field("playbook_id", playbook.id.as_str())
                    .with_field("cooldown_ms", playbook.cooldown_ms);
                    let _ = self.bus.emit(skip).await;
                    return;
                }
            }
        }

        // Per-playbook breaker.
        let breaker_key = BreakerKey::playbook(playbook.id.clone());
        if !self.breakers.should_execute(&breaker_key).await {
            debug!(playbook = %playbook.id, "playbook breaker open, skipping");
            return;
        }

        // Confirmation-gated playbooks only announce their plan.
        if !playbook.auto_execute {
            let plan: Vec<&'static str> = playbook.actions.iter().map(|a| a.kind.as_str()).collect();
            let pending = core_event(
                event_types::REACTOR_PENDING_CONFIRM,
                "reactor",
                EventSeverity::Warning,
            )
            .with_field("playbook_id", playbook.id.as_str())
            .with_field("risk_class", playbook.risk_class.as_str())
            .with_field("actions", serde_json::json!(plan));
            let _ = self.bus.emit(pending).await;
            self.journal(&playbook, &event, now, "pending_confirm", 0, None)
                .await;
            return;
        }

        {
            let mut stats = self.stats.lock().await;
            let entry = stats.entry(playbook.id.clone()).or_default();
            entry.last_executed_ms = Some(now);
            entry.execution_count += 1;
        }

        let ctx = ActionContext {
            event: event.clone(),
            playbook_id: playbook.id.clone(),
        };

        let mut actions_run = 0usize;
        let mut failure: Option<String> = None;
        for action in &playbook.actions {
            match self.run_action(action, &ctx).await {
                Ok(()) => actions_run += 1,
                Err(detail) => {
                    failure = Some(detail);
                    break;
                }
            }
        }

        let verified = if failure.is_none() {
            match &playbook.verify {
                Some(spec) => self.verify(spec).await,
                None => true,
            }
        } else {
            false
        };

        if verified {
            let mut stats = self.stats.lock().await;
            if let Some(entry) = stats.get_mut(&playbook.id) {
                entry.success_count += 1;
            }
            drop(stats);
            info!(playbook = %playbook.id, "playbook succeeded");
            self.breakers.record_success(&breaker_key).await;
            let success = core_event(event_types::REACTOR_SUCCESS, "reactor", EventSeverity::Info)
                .with_field("playbook_id", playbook.id.as_str())
                .with_field("actions_run", actions_run);
            let _ = self.bus.emit(success).await;
            self.journal(&playbook, &event, now, "success", actions_run, None)
                .await;
            return;
        }

        // Action error or failed verify: run rollback actions best-effort.
        let detail = failure
            .clone()
            .unwrap_or_else(|| "verify failed".to_string());
        warn!(playbook = %playbook.id, detail, "playbook failed, rolling back");
        for action in &playbook.rollback_actions {
            if let Err(e) = self.run_action(action, &ctx).await {
                warn!(playbook = %playbook.id, error = %e, "rollback action failed");
            }
        }

        {
            let mut stats = self.stats.lock().await;
            if let Some(entry) = stats.get_mut(&playbook.id) {
                entry.failure_count += 1;
            }
        }
        self.breakers
            .record_failure(&breaker_key, &ErrorSignature::Other)
            .await;
        let failed = core_event(event_types::REACTOR_FAILED, "reactor", EventSeverity::Error)
            .with_field("playbook_id", playbook.id.as_str())
            .with_field("detail", detail.clone())
            .with_field("rolled_back", !playbook.rollback_actions.is_empty());
        let _ = self.bus.emit(failed).await;
        self.journal(&playbook, &event, now, "failed", actions_run, Some(detail))
            .await;
    }

    async fn run_action(
        &self,
        action: &ActionDescriptor,
        ctx: &ActionContext,
    ) -> Result<(), String> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&action.kind).cloned()
        };
        let Some(handler) = handler else {
            return Err(format!("no handler registered for {}", action.kind.as_str()));
        };

        let timeout = action
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_action_timeout);
        match tokio::time::timeout(timeout, handler.handle(action, ctx)).await {
            Ok(Ok(result)) if result.ok => Ok(()),
            Ok(Ok(result)) => Err(result.detail),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "action {} timed out after {}ms",
                action.kind.as_str(),
                timeout.as_millis()
            )),
        }
    }

    /// Poll the metric probe until the bound is satisfied or the window
    /// closes. A metric that never measures fails the verify.
    async fn verify(&self, spec: &VerifySpec) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(spec.within_ms);
        loop {
            if let Some(value) = self.probe.measure(&spec.metric).await {
                if spec.satisfied_by(value) {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            let remaining = deadline - tokio::time::Instant::now();
            tokio::time::sleep(self.config.verify_poll.min(remaining)).await;
        }
    }

    async fn journal(
        &self,
        playbook: &Playbook,
        event: &Event,
        started_ms: i64,
        outcome: &str,
        actions_run: usize,
        detail: Option<String>,
    ) {
        let record = ExecutionRecord {
            playbook_id: playbook.id.clone(),
            trigger_event: event.event_type.as_str().to_string(),
            started_ms,
            outcome: outcome.to_string(),
            actions_run,
            detail,
        };
        if let Err(e) = self.store.append(Stream::PlaybookExec, &record, true).await {
            warn!(error = %e, "failed to journal playbook execution");
        }
    }
}

struct ReactorSubscriber {
    reactor: Arc<Reactor>,
}

#[async_trait::async_trait]
impl EventSubscriber for ReactorSubscriber {
    fn name(&self) -> &str {
        "reactor"
    }

    async fn on_event(&self, event: &Event) -> Result<(), String> {
        self.reactor.on_event(event).await;
        Ok(())
    }
}
