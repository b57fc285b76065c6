//! The self-improving loop.
//!
//! Observe production traces over a window, analyze them for recurring
//! error signatures, slow clusters, and low success rates, map each finding
//! to a configuration change proposal, gate the proposal, apply approved
//! low-risk changes through the registry (which snapshots for rollback),
//! verify after an observation window, and revert on regression. A per-agent
//! cooldown prevents thrashing. The cycle is driven by the heartbeat cadence
//! and by bursts of failure events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::domain::models::event::event_types;
use crate::domain::models::{
    AgentConfig, AgentId, AgentPatch, ChangeProposal, Env, ErrorSignature, EventSeverity,
    FieldChange, MetricsSnapshot, ProposalId, ProposalStatus, RiskClass, ThinkingLevel,
};
use crate::domain::ports::Clock;
use crate::services::agent_registry::{AgentRegistry, RegistryError};
use crate::services::event_bus::{core_event, EventBus};
use crate::services::event_store::{EventStore, Stream, StoreError};
use crate::services::quality_gates::{GateVerdict, QualityGates};
use crate::services::rollback::{Rollback, SnapshotReason};
use crate::services::trace_recorder::TraceRecorder;

/// Loop tuning knobs.
#[derive(Debug, Clone)]
pub struct ImprovementConfig {
    /// Observation window over production traces.
    pub window: Duration,
    /// Minimum gap between cycles touching the same agent.
    pub agent_cooldown: Duration,
    /// Agents below this success rate attract a thinking-level proposal.
    pub target_success_rate: f64,
    /// Timeout raise applied on recurring timeout failures.
    pub timeout_increase_factor: f64,
    /// Frequency class boundaries in tasks/day.
    pub high_freq_per_day: f64,
    pub medium_freq_per_day: f64,
    /// Signature-count trigger thresholds per frequency class.
    pub base_threshold_high: u32,
    pub base_threshold_medium: u32,
    pub base_threshold_low: u32,
    /// Applied to the base threshold for agents flagged critical; below 1.0
    /// makes critical agents trip earlier.
    pub critical_multiplier: f64,
    /// How long after apply before metrics_after is judged.
    pub verify_window: Duration,
    /// Failure-burst trigger: this many failures inside the burst window.
    pub failure_burst_threshold: u32,
    pub failure_burst_window: Duration,
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(24 * 3600),
            agent_cooldown: Duration::from_secs(6 * 3600),
            target_success_rate: 0.8,
            timeout_increase_factor: 1.5,
            high_freq_per_day: 50.0,
            medium_freq_per_day: 10.0,
            base_threshold_high: 10,
            base_threshold_medium: 5,
            base_threshold_low: 3,
            critical_multiplier: 0.5,
            verify_window: Duration::from_secs(1800),
            failure_burst_threshold: 10,
            failure_burst_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum ImprovementError {
    #[error("unknown proposal {0}")]
    UnknownProposal(ProposalId),

    #[error("proposal {0} is not awaiting approval")]
    NotGated(ProposalId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Summary of one cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleReport {
    pub agents_analyzed: usize,
    pub proposals_created: usize,
    pub applied: usize,
    pub gated: usize,
    pub rejected: usize,
    pub reverted: usize,
}

#[derive(Debug, Clone)]
struct PendingVerification {
    proposal_id: ProposalId,
    agent_id: AgentId,
    applied_at_ms: i64,
    baseline: MetricsSnapshot,
}

/// Orchestrates observe → analyze → propose → gate → apply → verify →
/// rollback.
pub struct SelfImprovingLoop {
    traces: Arc<TraceRecorder>,
    registry: Arc<AgentRegistry>,
    gates: QualityGates,
    rollback: Arc<Rollback>,
    store: Arc<EventStore>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: ImprovementConfig,
    proposals: RwLock<HashMap<ProposalId, ChangeProposal>>,
    last_cycle: Mutex<HashMap<AgentId, i64>>,
    pending_verify: Mutex<Vec<PendingVerification>>,
    recent_failures: Mutex<VecDeque<i64>>,
}

impl SelfImprovingLoop {
    pub fn new(
        traces: Arc<TraceRecorder>,
        registry: Arc<AgentRegistry>,
        gates: QualityGates,
        rollback: Arc<Rollback>,
        store: Arc<EventStore>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: ImprovementConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            traces,
            registry,
            gates,
            rollback,
            store,
            bus,
            clock,
            config,
            proposals: RwLock::new(HashMap::new()),
            last_cycle: Mutex::new(HashMap::new()),
            pending_verify: Mutex::new(Vec::new()),
            recent_failures: Mutex::new(VecDeque::new()),
        })
    }

    /// Adaptive signature-count threshold for one agent:
    /// `base(freq_class) × critical_multiplier`, minimum 1.
    fn adaptive_threshold(&self, agent: &AgentConfig, tasks_per_day: f64) -> u32 {
        let base = if tasks_per_day >= self.config.high_freq_per_day {
            self.config.base_threshold_high
        } else if tasks_per_day >= self.config.medium_freq_per_day {
            self.config.base_threshold_medium
        } else {
            self.config.base_threshold_low
        };
        let multiplier = if agent.critical {
            self.config.critical_multiplier
        } else {
            1.0
        };
        ((f64::from(base) * multiplier).ceil() as u32).max(1)
    }

    /// Record an observed task failure; returns true when the burst
    /// threshold is crossed and a cycle should run now.
    pub async fn note_failure(&self) -> bool {
        let now = self.clock.now_ms();
        let cutoff = now - self.config.failure_burst_window.as_millis() as i64;
        let mut failures = self.recent_failures.lock().await;
        failures.push_back(now);
        while failures.front().is_some_and(|ts| *ts < cutoff) {
            failures.pop_front();
        }
        if failures.len() as u32 >= self.config.failure_burst_threshold {
            failures.clear();
            true
        } else {
            false
        }
    }

    /// One full cycle over all production agents.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleReport, ImprovementError> {
        let mut report = CycleReport::default();
        let now_ms = self.clock.now_ms();
        let window_ms = self.config.window.as_millis() as i64;

        for agent in self.registry.list().await {
            if agent.env != Env::Prod {
                continue;
            }
            {
                let last = self.last_cycle.lock().await;
                if let Some(ts) = last.get(&agent.id) {
                    if now_ms - ts < self.config.agent_cooldown.as_millis() as i64 {
                        continue;
                    }
                }
            }

            let traces = self
                .traces
                .for_agent_since(&agent.id, now_ms - window_ms, Some(Env::Prod))
                .await;
            if traces.is_empty() {
                continue;
            }
            report.agents_analyzed += 1;

            let window_days = (window_ms as f64 / 86_400_000.0).max(f64::EPSILON);
            let tasks_per_day = traces.len() as f64 / window_days;
            let threshold = self.adaptive_threshold(&agent, tasks_per_day);

            let metrics_before = {
                let successes = traces.iter().filter(|t| t.success).count();
                let total_duration: u64 = traces.iter().map(|t| t.duration_ms).sum();
                MetricsSnapshot {
                    success_rate: successes as f64 / traces.len() as f64,
                    avg_duration_ms: total_duration as f64 / traces.len() as f64,
                    sample_count: traces.len(),
                }
            };

            let mut signature_counts: HashMap<String, u32> = HashMap::new();
            for trace in &traces {
                if let Some(sig) = &trace.error_signature {
                    *signature_counts.entry(sig.wire()).or_default() += 1;
                }
            }

            let Some((patch, justification, risk)) = self.propose_for(
                &agent,
                &signature_counts,
                &metrics_before,
                threshold,
            ) else {
                continue;
            };

            self.last_cycle.lock().await.insert(agent.id.clone(), now_ms);

            let proposed = patch.apply_to(&agent);
            let diff = crate::services::agent_registry::diff_configs(&agent, &proposed);
            let mut proposal = ChangeProposal::new(
                agent.id.clone(),
                agent.config_version,
                diff,
                justification,
                risk,
                metrics_before.clone(),
                self.clock.now(),
            );
            report.proposals_created += 1;
            self.persist(&proposal).await;
            let created = core_event(
                event_types::PROPOSAL_CREATED,
                "improvement_loop",
                EventSeverity::Info,
            )
            .with_agent(agent.id.clone())
            .with_field("proposal_id", proposal.id.to_string())
            .with_field("risk_class", proposal.risk_class.as_str())
            .with_field("justification", proposal.justification.clone());
            let _ = self.bus.emit(created).await;

            match self.gates.evaluate(&mut proposal, &proposed).await {
                GateVerdict::Approved => {
                    proposal.status = ProposalStatus::Approved;
                    if proposal.risk_class == RiskClass::Low {
                        self.apply(&mut proposal, &patch).await?;
                        report.applied += 1;
                    } else {
                        // Safety net: approval without low risk still waits.
                        proposal.status = ProposalStatus::Gated;
                        report.gated += 1;
                    }
                }
                GateVerdict::PendingHuman => {
                    proposal.status = ProposalStatus::Gated;
                    report.gated += 1;
                }
                GateVerdict::Rejected { gate, reason } => {
                    proposal.status = ProposalStatus::Rejected;
                    proposal.failed_gate = Some(gate);
                    report.rejected += 1;
                    let rejected = core_event(
                        event_types::PROPOSAL_REJECTED,
                        "improvement_loop",
                        EventSeverity::Warning,
                    )
                    .with_field("proposal_id", proposal.id.to_string())
                    .with_field("gate", gate.as_str())
                    .with_field("reason", reason);
                    let _ = self.bus.emit(rejected).await;
                }
            }

            self.persist(&proposal).await;
            self.proposals.write().await.insert(proposal.id, proposal);
        }

        report.reverted = self.check_verifications().await?;
        Ok(report)
    }

    /// Map analysis findings to a proposal, most specific rule first.
    fn propose_for(
        &self,
        agent: &AgentConfig,
        signature_counts: &HashMap<String, u32>,
        metrics: &MetricsSnapshot,
        threshold: u32,
    ) -> Option<(AgentPatch, String, RiskClass)> {
        let count = |sig: &ErrorSignature| signature_counts.get(&sig.wire()).copied().unwrap_or(0);

        let timeouts = count(&ErrorSignature::Timeout);
        if timeouts >= threshold {
            let new_timeout =
                (agent.timeout_default_ms as f64 * self.config.timeout_increase_factor) as u64;
            return Some((
                AgentPatch {
                    timeout_default_ms: Some(new_timeout),
                    ..Default::default()
                },
                format!(
                    "{timeouts} timeout failures in window (threshold {threshold}); raising timeout {}ms -> {new_timeout}ms",
                    agent.timeout_default_ms
                ),
                RiskClass::Low,
            ));
        }

        let rate_limits = count(&ErrorSignature::ApiRateLimit);
        if rate_limits >= threshold && agent.max_in_flight > 1 {
            return Some((
                AgentPatch {
                    max_in_flight: Some(agent.max_in_flight - 1),
                    ..Default::default()
                },
                format!(
                    "{rate_limits} rate-limit failures in window (threshold {threshold}); lowering concurrency to {}",
                    agent.max_in_flight - 1
                ),
                RiskClass::Low,
            ));
        }

        if metrics.success_rate < self.config.target_success_rate
            && metrics.sample_count as u32 >= threshold
            && agent.thinking_level < ThinkingLevel::High
        {
            return Some((
                AgentPatch {
                    thinking_level: Some(agent.thinking_level.raised()),
                    ..Default::default()
                },
                format!(
                    "success rate {:.2} below target {:.2}; raising thinking level to {}",
                    metrics.success_rate,
                    self.config.target_success_rate,
                    agent.thinking_level.raised().as_str()
                ),
                // Prompt-behavior changes get a human in the loop.
                RiskClass::Medium,
            ));
        }

        None
    }

    async fn apply(
        &self,
        proposal: &mut ChangeProposal,
        patch: &AgentPatch,
    ) -> Result<(), ImprovementError> {
        let new_version = self
            .registry
            .update(
                &proposal.target_agent,
                patch,
                SnapshotReason::ProposalApply(proposal.id),
            )
            .await?;
        proposal.status = ProposalStatus::Applied;
        proposal.applied_version = Some(new_version);

        self.pending_verify.lock().await.push(PendingVerification {
            proposal_id: proposal.id,
            agent_id: proposal.target_agent.clone(),
            applied_at_ms: self.clock.now_ms(),
            baseline: proposal.metrics_before.clone(),
        });

        info!(
            proposal = %proposal.id,
            agent = %proposal.target_agent,
            version = new_version,
            "proposal applied"
        );
        let applied = core_event(
            event_types::PROPOSAL_APPLIED,
            "improvement_loop",
            EventSeverity::Info,
        )
        .durable(true)
        .with_agent(proposal.target_agent.clone())
        .with_field("proposal_id", proposal.id.to_string())
        .with_field("config_version", new_version);
        let _ = self.bus.emit(applied).await;
        Ok(())
    }

    /// Judge applied proposals whose verification window has closed; revert
    /// regressions. Returns how many were reverted.
    pub async fn check_verifications(&self) -> Result<usize, ImprovementError> {
        let now_ms = self.clock.now_ms();
        let due: Vec<PendingVerification> = {
            let mut pending = self.pending_verify.lock().await;
            let window = self.config.verify_window.as_millis() as i64;
            let (ready, waiting): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|p| now_ms - p.applied_at_ms >= window);
            *pending = waiting;
            ready
        };

        let mut reverted = 0usize;
        for verification in due {
            let observed = self
                .traces
                .metrics_since(&verification.agent_id, verification.applied_at_ms)
                .await;

            let regression = self
                .rollback
                .revert_on_regression(
                    &verification.agent_id,
                    &verification.baseline,
                    verification.applied_at_ms,
                    Some(verification.proposal_id),
                )
                .await;

            let mut proposals = self.proposals.write().await;
            let Some(proposal) = proposals.get_mut(&verification.proposal_id) else {
                continue;
            };
            proposal.metrics_after = Some(observed.clone());

            match regression {
                Ok(Some(report)) => {
                    proposal.status = ProposalStatus::Reverted;
                    reverted += 1;
                    warn!(
                        proposal = %proposal.id,
                        agent = %verification.agent_id,
                        success_drop = report.success_drop,
                        "verification failed, proposal reverted"
                    );
                    let event = core_event(
                        event_types::PROPOSAL_REVERTED,
                        "improvement_loop",
                        EventSeverity::Warning,
                    )
                    .with_agent(verification.agent_id.clone())
                    .with_field("proposal_id", proposal.id.to_string())
                    .with_field("success_drop", report.success_drop)
                    .with_field("duration_increase", report.duration_increase);
                    let _ = self.bus.emit(event).await;
                }
                Ok(None) => {
                    if observed.sample_count < 1 {
                        // No traffic yet; put it back and wait for traffic.
                        drop(proposals);
                        self.pending_verify.lock().await.push(verification);
                        continue;
                    }
                    info!(proposal = %proposal.id, "verification passed");
                }
                Err(e) => {
                    warn!(proposal = %proposal.id, error = %e, "verification rollback failed");
                }
            }
            let snapshot = proposal.clone();
            drop(proposals);
            self.persist(&snapshot).await;
        }
        Ok(reverted)
    }

    /// Operator approval of a gated proposal: applies it immediately.
    pub async fn approve(&self, id: ProposalId) -> Result<u64, ImprovementError> {
        let (mut proposal, patch) = {
            let proposals = self.proposals.read().await;
            let proposal = proposals
                .get(&id)
                .ok_or(ImprovementError::UnknownProposal(id))?;
            if proposal.status != ProposalStatus::Gated {
                return Err(ImprovementError::NotGated(id));
            }
            (proposal.clone(), patch_from_diff(&proposal.diff))
        };

        proposal.status = ProposalStatus::Approved;
        self.apply(&mut proposal, &patch).await?;
        let version = proposal.applied_version.unwrap_or_default();
        self.persist(&proposal).await;
        self.proposals.write().await.insert(id, proposal);
        Ok(version)
    }

    /// Operator rejection of a gated proposal.
    pub async fn reject(&self, id: ProposalId) -> Result<(), ImprovementError> {
        let mut proposals = self.proposals.write().await;
        let proposal = proposals
            .get_mut(&id)
            .ok_or(ImprovementError::UnknownProposal(id))?;
        if proposal.status != ProposalStatus::Gated {
            return Err(ImprovementError::NotGated(id));
        }
        proposal.status = ProposalStatus::Rejected;
        proposal.failed_gate = Some(crate::domain::models::GateLevel::L2);
        let snapshot = proposal.clone();
        drop(proposals);
        self.persist(&snapshot).await;
        let _ = self
            .bus
            .emit(
                core_event(
                    event_types::PROPOSAL_REJECTED,
                    "improvement_loop",
                    EventSeverity::Info,
                )
                .with_field("proposal_id", id.to_string())
                .with_field("gate", "L2"),
            )
            .await;
        Ok(())
    }

    pub async fn list(&self, status: Option<ProposalStatus>) -> Vec<ChangeProposal> {
        let proposals = self.proposals.read().await;
        let mut out: Vec<_> = proposals
            .values()
            .filter(|p| status.is_none_or(|s| p.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|p| p.created_at);
        out
    }

    pub async fn get(&self, id: ProposalId) -> Option<ChangeProposal> {
        self.proposals.read().await.get(&id).cloned()
    }

    async fn persist(&self, proposal: &ChangeProposal) {
        if let Err(e) = self.store.append(Stream::Proposals, proposal, true).await {
            warn!(proposal = %proposal.id, error = %e, "failed to persist proposal");
        }
    }
}

/// Rebuild a patch from a proposal's field diff (used when a gated proposal
/// is approved later).
fn patch_from_diff(diff: &[FieldChange]) -> AgentPatch {
    let mut patch = AgentPatch::default();
    for change in diff {
        match change.field.as_str() {
            "model_id" => patch.model_id = change.to.as_str().map(ToString::to_string),
            "thinking_level" => {
                patch.thinking_level =
                    serde_json::from_value(change.to.clone()).ok();
            }
            "timeout_default_ms" => patch.timeout_default_ms = change.to.as_u64(),
            "system_prompt" => patch.system_prompt = change.to.as_str().map(ToString::to_string),
            "tool_permissions" => {
                patch.tool_permissions = parse_string_list(&change.to);
            }
            "task_types" => patch.task_types = parse_string_list(&change.to),
            "capabilities" => patch.capabilities = parse_string_list(&change.to),
            "max_in_flight" => patch.max_in_flight = change.to.as_u64().map(|v| v as u32),
            "priority_class" => {
                patch.priority_class = change
                    .to
                    .as_str()
                    .and_then(crate::domain::models::TaskPriority::from_str);
            }
            _ => {}
        }
    }
    patch
}

fn parse_string_list(value: &Value) -> Option<Vec<String>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect()
    })
}
