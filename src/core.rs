//! The `Core` container.
//!
//! Every component is constructed once here and wired together explicitly;
//! nothing lives in module globals. The struct doubles as the operator
//! control surface: task submission and cancellation, agent management,
//! proposal approval, and the read-only projections a dashboard consumes.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::domain::models::event::event_types;
use crate::domain::models::{
    ActionKind, AgentConfig, AgentId, AgentPatch, AgentStatsSnapshot, ChangeProposal, Event,
    EventPattern, HealthReport, Plan, PlanStrategy, ProposalId, ProposalStatus, QueueStatus,
    TaskId, TaskSpec,
};
use crate::domain::ports::{
    ActionHandler, AgentWorker, Clock, MetricProbe, Notifier, SystemClock,
};
use crate::infrastructure::config::AiosConfig;
use crate::services::agent_registry::{diff_configs, AgentRegistry, RegistryError};
use crate::services::builtin_handlers::{
    AgentRestartHandler, ConfigUpdateHandler, NotifyActionHandler, RollbackTriggerHandler,
    SchedulerEnqueueHandler,
};
use crate::services::circuit_breaker::CircuitBreakers;
use crate::services::dispatcher::{AgentLoadTable, Dispatcher};
use crate::services::event_bus::{EventBus, EventSubscriber};
use crate::services::event_store::{EventStore, Stream};
use crate::services::heartbeat::Heartbeat;
use crate::services::improvement_loop::{ImprovementError, SelfImprovingLoop};
use crate::services::planner::{Planner, PlannerError};
use crate::services::playbook_library::PlaybookLibrary;
use crate::services::quality_gates::{GateVerdict, QualityGates};
use crate::services::reactor::Reactor;
use crate::services::rollback::{Rollback, RollbackError, SnapshotReason, SnapshotVault};
use crate::services::router::Router;
use crate::services::scheduler::{Scheduler, SchedulerError};
use crate::services::trace_recorder::TraceRecorder;

/// Errors surfaced by the control surface.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Improvement(#[from] ImprovementError),

    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error("update rejected by gate {gate}: {reason}")]
    UpdateRejected { gate: &'static str, reason: String },

    #[error("update parked for human approval as proposal {0}")]
    UpdateGated(ProposalId),

    #[error("startup failed: {0}")]
    Startup(String),
}

/// All externally-supplied collaborators.
pub struct CorePorts {
    pub worker: Arc<dyn AgentWorker>,
    pub notifier: Arc<dyn Notifier>,
    pub probe: Arc<dyn MetricProbe>,
    pub clock: Arc<dyn Clock>,
}

impl CorePorts {
    pub fn new(worker: Arc<dyn AgentWorker>) -> Self {
        Self {
            worker,
            notifier: Arc::new(crate::domain::ports::NullNotifier),
            probe: Arc::new(crate::domain::ports::NullProbe),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn probe(mut self, probe: Arc<dyn MetricProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// The assembled control plane.
pub struct Core {
    config: AiosConfig,
    store: Arc<EventStore>,
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    breakers: Arc<CircuitBreakers>,
    traces: Arc<TraceRecorder>,
    library: Arc<PlaybookLibrary>,
    planner: Planner,
    scheduler: Arc<Scheduler>,
    rollback: Arc<Rollback>,
    improvement: Arc<SelfImprovingLoop>,
    reactor: Arc<Reactor>,
    heartbeat: Arc<Heartbeat>,
    worker: Arc<dyn AgentWorker>,
    clock: Arc<dyn Clock>,
    heartbeat_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Core {
    /// Build and wire the whole control plane. Recovers persisted state
    /// (agents, traces, snapshots, queued tasks) before anything runs.
    pub async fn start(config: AiosConfig, ports: CorePorts) -> Result<Arc<Self>, CoreError> {
        let clock = ports.clock.clone();

        let (store, repairs) = EventStore::open(config.store_config())
            .map_err(|e| CoreError::Startup(format!("opening event store: {e}")))?;
        let store = Arc::new(store);

        let bus = EventBus::new(store.clone(), clock.clone(), config.env, config.bus_config());
        bus.announce_repairs(&repairs).await;

        let vault = Arc::new(SnapshotVault::new(store.clone(), 32));
        if let Err(e) = vault.recover().await {
            warn!(error = %e, "snapshot history recovery failed");
        }

        let registry = Arc::new(AgentRegistry::new(
            vault.clone(),
            store.clone(),
            bus.clone(),
            clock.clone(),
        ));
        match registry.recover().await {
            Ok(count) if count > 0 => info!(agents = count, "agent registry recovered"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "agent registry recovery failed"),
        }

        let breakers = Arc::new(CircuitBreakers::new(
            config.breaker_config(),
            bus.clone(),
            clock.clone(),
        ));

        let traces = Arc::new(TraceRecorder::new(
            store.clone(),
            registry.clone(),
            bus.clone(),
            clock.clone(),
        ));
        if let Err(e) = traces.recover().await {
            warn!(error = %e, "trace history recovery failed");
        }

        let loads = Arc::new(AgentLoadTable::new());
        let dispatcher = Arc::new(Dispatcher::new(
            ports.worker.clone(),
            traces.clone(),
            breakers.clone(),
            loads.clone(),
            config.dispatcher_config(),
        ));
        let router = Arc::new(Router::new(
            registry.clone(),
            breakers.clone(),
            loads,
            config.router_config(),
        ));

        let scheduler = Scheduler::new(
            router,
            dispatcher,
            traces.clone(),
            bus.clone(),
            store.clone(),
            clock.clone(),
            config.scheduler_config(),
        );
        if let Err(e) = scheduler.recover().await {
            warn!(error = %e, "task queue recovery failed");
        }

        let rollback = Arc::new(Rollback::new(
            vault,
            registry.clone(),
            traces.clone(),
            bus.clone(),
            ports.notifier.clone(),
            clock.clone(),
            config.rollback_config(),
        ));

        let gates = QualityGates::new(traces.clone(), ports.worker.clone(), config.gate_config());
        let improvement = SelfImprovingLoop::new(
            traces.clone(),
            registry.clone(),
            gates,
            rollback.clone(),
            store.clone(),
            bus.clone(),
            clock.clone(),
            config.improvement_config(),
        );

        let library = Arc::new(
            PlaybookLibrary::from_path(&config.playbooks_path)
                .await
                .map_err(|e| CoreError::Startup(format!("loading playbooks: {e}")))?,
        );

        let reactor = Reactor::new(
            library.clone(),
            breakers.clone(),
            ports.probe,
            bus.clone(),
            store.clone(),
            clock.clone(),
            config.reactor_config(),
        );
        reactor.attach().await;

        let heartbeat = Heartbeat::new(
            scheduler.clone(),
            improvement.clone(),
            breakers.clone(),
            traces.clone(),
            store.clone(),
            bus.clone(),
            ports.notifier.clone(),
            clock.clone(),
            config.heartbeat_config(),
        );

        // Built-in action handlers. exec.command stays external; register a
        // handler for it through `register_action_handler` when needed.
        reactor
            .register_handler(
                ActionKind::Notify,
                Arc::new(NotifyActionHandler::new(ports.notifier.clone())),
            )
            .await;
        reactor
            .register_handler(
                ActionKind::SchedulerEnqueue,
                Arc::new(SchedulerEnqueueHandler::new(scheduler.clone())),
            )
            .await;
        reactor
            .register_handler(
                ActionKind::RollbackTrigger,
                Arc::new(RollbackTriggerHandler::new(rollback.clone())),
            )
            .await;
        reactor
            .register_handler(
                ActionKind::AgentRestart,
                Arc::new(AgentRestartHandler::new(breakers.clone())),
            )
            .await;
        reactor
            .register_handler(
                ActionKind::ConfigUpdate,
                Arc::new(ConfigUpdateHandler::new(heartbeat.clone(), registry.clone())),
            )
            .await;

        let planner = Planner::new(store.clone(), clock.clone());

        let core = Arc::new(Self {
            config,
            store,
            bus: bus.clone(),
            registry,
            breakers,
            traces,
            library: library.clone(),
            planner,
            scheduler,
            rollback,
            improvement: improvement.clone(),
            reactor,
            heartbeat,
            worker: ports.worker,
            clock,
            heartbeat_handle: tokio::sync::Mutex::new(None),
        });

        // Hot reload on the playbook change event.
        let _ = bus
            .subscribe(
                event_types::CORE_PLAYBOOKS_CHANGED,
                Arc::new(PlaybookReloadSubscriber { library }),
            )
            .await;

        // A burst of failures triggers an improvement cycle off-cadence.
        let _ = bus
            .subscribe(
                event_types::AGENT_TASK_FAILED,
                Arc::new(FailureBurstSubscriber { improvement }),
            )
            .await;

        info!(env = core.config.env.as_str(), "core started");
        Ok(core)
    }

    /// Start the periodic heartbeat driver.
    pub async fn spawn_heartbeat(self: &Arc<Self>) {
        let mut handle = self.heartbeat_handle.lock().await;
        if handle.is_none() {
            *handle = Some(self.heartbeat.start());
        }
    }

    /// Stop the heartbeat, drain bus subscriptions, and flush state.
    pub async fn shutdown(&self) {
        self.heartbeat.stop();
        if let Some(handle) = self.heartbeat_handle.lock().await.take() {
            handle.abort();
        }
        self.bus.shutdown().await;
        info!("core stopped");
    }

    // --- control surface -------------------------------------------------

    pub async fn submit_task(self: &Arc<Self>, spec: TaskSpec) -> Result<TaskId, CoreError> {
        Ok(self.scheduler.submit(spec).await?)
    }

    pub async fn cancel_task(self: &Arc<Self>, task_id: TaskId) -> Result<(), CoreError> {
        Ok(self.scheduler.cancel(task_id).await?)
    }

    /// Decompose a description and submit the resulting plan.
    pub async fn submit_plan(
        self: &Arc<Self>,
        description: &str,
        strategy: PlanStrategy,
    ) -> Result<Plan, CoreError> {
        let plan = self.planner.decompose(description, strategy).await?;
        self.scheduler.submit_plan(&plan).await?;
        Ok(plan)
    }

    /// Submit a pre-built plan (explicit DAGs).
    pub async fn submit_prepared_plan(self: &Arc<Self>, plan: &Plan) -> Result<Vec<TaskId>, CoreError> {
        Ok(self.scheduler.submit_plan(plan).await?)
    }

    pub async fn register_agent(&self, config: AgentConfig) -> Result<(), CoreError> {
        Ok(self.registry.register(config).await?)
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> Option<Arc<AgentConfig>> {
        self.registry.get(agent_id).await
    }

    pub async fn list_agents(&self) -> Vec<Arc<AgentConfig>> {
        self.registry.list().await
    }

    /// Operator config update. When `gate_manual_updates` is set the patch
    /// runs through the quality gates like any proposal.
    pub async fn update_agent(
        &self,
        agent_id: &AgentId,
        patch: AgentPatch,
    ) -> Result<u64, CoreError> {
        if !self.config.gate_manual_updates {
            return Ok(self
                .registry
                .update(agent_id, &patch, SnapshotReason::ConfigUpdate)
                .await?);
        }

        let current = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.clone()))?;
        let proposed = patch.apply_to(&current);
        let diff = diff_configs(&current, &proposed);
        let metrics = self.traces.metrics_since(agent_id, 0).await;
        let mut proposal = ChangeProposal::new(
            agent_id.clone(),
            current.config_version,
            diff,
            "operator update",
            crate::domain::models::RiskClass::Low,
            metrics,
            self.clock.now(),
        );

        let gates = QualityGates::new(
            self.traces.clone(),
            self.worker.clone(),
            self.config.gate_config(),
        );
        match gates.evaluate(&mut proposal, &proposed).await {
            GateVerdict::Approved => Ok(self
                .registry
                .update(agent_id, &patch, SnapshotReason::ConfigUpdate)
                .await?),
            GateVerdict::PendingHuman => Err(CoreError::UpdateGated(proposal.id)),
            GateVerdict::Rejected { gate, reason } => Err(CoreError::UpdateRejected {
                gate: gate.as_str(),
                reason,
            }),
        }
    }

    pub async fn list_proposals(&self, status: Option<ProposalStatus>) -> Vec<ChangeProposal> {
        self.improvement.list(status).await
    }

    pub async fn approve_proposal(&self, id: ProposalId) -> Result<u64, CoreError> {
        Ok(self.improvement.approve(id).await?)
    }

    pub async fn reject_proposal(&self, id: ProposalId) -> Result<(), CoreError> {
        Ok(self.improvement.reject(id).await?)
    }

    /// Manual rollback by proposal id.
    pub async fn rollback_proposal(&self, id: ProposalId) -> Result<u64, CoreError> {
        Ok(self.rollback.revert_proposal(id).await?)
    }

    /// One manual tick; the testing entry point.
    pub async fn trigger_heartbeat(&self) {
        self.heartbeat.tick().await;
    }

    // --- read-only projections -------------------------------------------

    pub async fn system_health(&self) -> HealthReport {
        self.heartbeat.health_report().await
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.scheduler.queue_status().await
    }

    /// Tail of the persisted event log filtered by a type pattern.
    pub fn recent_events(&self, pattern: &str, limit: usize) -> Vec<Event> {
        let stream = match self.config.env {
            crate::domain::models::Env::Prod => Stream::Events,
            crate::domain::models::Env::Test => Stream::TestEvents,
        };
        let Ok(pattern) = EventPattern::parse(pattern) else {
            return Vec::new();
        };
        let Ok(records) = self.store.read::<Event>(stream, 0) else {
            return Vec::new();
        };
        let mut events: Vec<Event> = records
            .into_iter()
            .map(|r| r.record)
            .filter(|e| pattern.matches(&e.event_type))
            .collect();
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
        events
    }

    pub async fn agent_stats(&self, agent_id: &AgentId) -> Option<AgentStatsSnapshot> {
        self.registry.stats_snapshot(agent_id).await
    }

    // --- component access for embedding processes ------------------------

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn store(&self) -> Arc<EventStore> {
        self.store.clone()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        self.registry.clone()
    }

    pub fn breakers(&self) -> Arc<CircuitBreakers> {
        self.breakers.clone()
    }

    pub fn traces(&self) -> Arc<TraceRecorder> {
        self.traces.clone()
    }

    pub fn playbooks(&self) -> Arc<PlaybookLibrary> {
        self.library.clone()
    }

    pub fn improvement(&self) -> Arc<SelfImprovingLoop> {
        self.improvement.clone()
    }

    pub fn heartbeat(&self) -> Arc<Heartbeat> {
        self.heartbeat.clone()
    }

    /// Register an external action handler (e.g. `exec.command`).
    pub async fn register_action_handler(
        &self,
        kind: ActionKind,
        handler: Arc<dyn ActionHandler>,
    ) {
        self.reactor.register_handler(kind, handler).await;
    }
}

struct PlaybookReloadSubscriber {
    library: Arc<PlaybookLibrary>,
}

#[async_trait::async_trait]
impl EventSubscriber for PlaybookReloadSubscriber {
    fn name(&self) -> &str {
        "playbook_reload"
    }

    async fn on_event(&self, _event: &Event) -> Result<(), String> {
        self.library.reload().await.map_err(|e| e.to_string())?;
        Ok(())
    }
}

struct FailureBurstSubscriber {
    improvement: Arc<SelfImprovingLoop>,
}

#[async_trait::async_trait]
impl EventSubscriber for FailureBurstSubscriber {
    fn name(&self) -> &str {
        "failure_burst"
    }

    async fn on_event(&self, _event: &Event) -> Result<(), String> {
        if self.improvement.note_failure().await {
            info!("failure burst detected, running improvement cycle");
            self.improvement
                .run_cycle()
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}
