//! Configuration snapshots and rollback.
//!
//! The vault owns the snapshot history: every registry mutation deposits the
//! pre-change config here before the new record goes live. The rollback
//! service reverts an agent to a snapshot — automatically on sustained
//! regression, or manually by proposal id — and reverting is idempotent:
//! applying the same rollback twice leaves the same final state as once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::domain::models::event::event_types;
use crate::domain::models::{
    AgentConfig, AgentId, EventSeverity, MetricsSnapshot, ProposalId,
};
use crate::domain::ports::{Clock, Notifier};
use crate::services::agent_registry::{AgentRegistry, RegistryError};
use crate::services::event_bus::{core_event, EventBus};
use crate::services::event_store::{EventStore, Stream, StoreError};
use crate::services::trace_recorder::TraceRecorder;

/// Why a snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotReason {
    ConfigUpdate,
    ProposalApply(ProposalId),
    Manual,
}

/// One deposited pre-change configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub agent_id: AgentId,
    pub config: AgentConfig,
    pub reason: SnapshotReason,
    pub taken_at: DateTime<Utc>,
}

/// Owner of the snapshot history, persisted on the `rollback` stream.
pub struct SnapshotVault {
    store: Arc<EventStore>,
    history: RwLock<HashMap<AgentId, VecDeque<Arc<SnapshotRecord>>>>,
    /// Snapshots retained per agent.
    capacity: usize,
}

impl SnapshotVault {
    pub fn new(store: Arc<EventStore>, capacity: usize) -> Self {
        Self {
            store,
            history: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Reload the in-memory ring from the persisted stream.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let records = self.store.read::<SnapshotRecord>(Stream::Rollback, 0)?;
        let count = records.len();
        let mut history = self.history.write().await;
        for stored in records {
            let record = Arc::new(stored.record);
            let ring = history.entry(record.agent_id.clone()).or_default();
            ring.push_back(record);
            while ring.len() > self.capacity {
                ring.pop_front();
            }
        }
        Ok(count)
    }

    /// Deposit a pre-change snapshot.
    pub async fn deposit(
        &self,
        config: &AgentConfig,
        reason: SnapshotReason,
        taken_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record = Arc::new(SnapshotRecord {
            agent_id: config.id.clone(),
            config: config.clone(),
            reason,
            taken_at,
        });
        self.store
            .append(Stream::Rollback, record.as_ref(), true)
            .await?;
        let mut history = self.history.write().await;
        let ring = history.entry(config.id.clone()).or_default();
        ring.push_back(record);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        Ok(())
    }

    /// Most recent snapshot for an agent.
    pub async fn latest(&self, agent_id: &AgentId) -> Option<Arc<SnapshotRecord>> {
        self.history
            .read()
            .await
            .get(agent_id)
            .and_then(|ring| ring.back().cloned())
    }

    /// Snapshot deposited when the given proposal was applied.
    pub async fn for_proposal(&self, proposal_id: ProposalId) -> Option<Arc<SnapshotRecord>> {
        let history = self.history.read().await;
        for ring in history.values() {
            for record in ring.iter().rev() {
                if record.reason == SnapshotReason::ProposalApply(proposal_id) {
                    return Some(record.clone());
                }
            }
        }
        None
    }

    pub async fn history(&self, agent_id: &AgentId) -> Vec<Arc<SnapshotRecord>> {
        self.history
            .read()
            .await
            .get(agent_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Error type for rollback operations.
#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("no snapshot available for agent {0}")]
    NoSnapshot(AgentId),

    #[error("no snapshot recorded for proposal {0}")]
    NoProposalSnapshot(ProposalId),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Regression thresholds for automatic rollback.
#[derive(Debug, Clone)]
pub struct RollbackConfig {
    /// Success-rate drop that counts as a regression.
    pub success_drop_threshold: f64,
    /// Relative average-duration increase that counts as a regression.
    pub duration_increase_threshold: f64,
    /// Minimum traces in the verification window before judging.
    pub min_traces: usize,
    /// Trace window consulted when judging a regression.
    pub window: Duration,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            success_drop_threshold: 0.10,
            duration_increase_threshold: 0.20,
            min_traces: 5,
            window: Duration::from_secs(3600),
        }
    }
}

/// Outcome of a regression check.
#[derive(Debug, Clone)]
pub struct RegressionReport {
    pub agent_id: AgentId,
    pub baseline: MetricsSnapshot,
    pub observed: MetricsSnapshot,
    pub success_drop: f64,
    pub duration_increase: f64,
}

/// Reverts agent configuration to deposited snapshots.
pub struct Rollback {
    vault: Arc<SnapshotVault>,
    registry: Arc<AgentRegistry>,
    traces: Arc<TraceRecorder>,
    bus: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: RollbackConfig,
}

impl Rollback {
    pub fn new(
        vault: Arc<SnapshotVault>,
        registry: Arc<AgentRegistry>,
        traces: Arc<TraceRecorder>,
        bus: Arc<EventBus>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: RollbackConfig,
    ) -> Self {
        Self {
            vault,
            registry,
            traces,
            bus,
            notifier,
            clock,
            config,
        }
    }

    /// Compare an agent's metrics over the recent window against a baseline.
    /// `Some` means the regression thresholds were crossed with enough
    /// samples to trust the judgement.
    pub async fn check_regression(
        &self,
        agent_id: &AgentId,
        baseline: &MetricsSnapshot,
        since_ms: i64,
    ) -> Option<RegressionReport> {
        let observed = self.traces.metrics_since(agent_id, since_ms).await;
        if observed.sample_count < self.config.min_traces {
            return None;
        }
        let success_drop = baseline.success_drop(&observed);
        let duration_increase = baseline.duration_increase(&observed);
        if success_drop > self.config.success_drop_threshold
            || duration_increase > self.config.duration_increase_threshold
        {
            Some(RegressionReport {
                agent_id: agent_id.clone(),
                baseline: baseline.clone(),
                observed,
                success_drop,
                duration_increase,
            })
        } else {
            None
        }
    }

    /// Revert an agent to a specific snapshot. Idempotent: when the live
    /// config already matches the snapshot content, nothing changes.
    #[instrument(skip(self, snapshot), fields(agent = %snapshot.agent_id))]
    pub async fn revert_to(
        &self,
        snapshot: &SnapshotRecord,
        reason: &str,
    ) -> Result<u64, RollbackError> {
        let current = self
            .registry
            .get(&snapshot.agent_id)
            .await
            .ok_or_else(|| RegistryError::UnknownAgent(snapshot.agent_id.clone()))?;

        if current.same_content(&snapshot.config) {
            info!(agent = %snapshot.agent_id, "rollback is a no-op, config already matches snapshot");
            return Ok(current.config_version);
        }

        let new_version = self.registry.restore(&snapshot.config).await?;

        let event = core_event(
            event_types::ROLLBACK_EXECUTED,
            "rollback",
            EventSeverity::Warning,
        )
        .with_agent(snapshot.agent_id.clone())
        .with_field("restored_from_version", snapshot.config.config_version)
        .with_field("new_version", new_version)
        .with_field("reason", reason);
        let _ = self.bus.emit(event).await;

        self.notifier
            .notify(
                EventSeverity::Warning,
                "agent configuration rolled back",
                &format!(
                    "agent {} reverted to snapshot from {} ({reason})",
                    snapshot.agent_id, snapshot.taken_at
                ),
                None,
            )
            .await;
        Ok(new_version)
    }

    /// Revert to the most recent snapshot of an agent.
    pub async fn revert_latest(
        &self,
        agent_id: &AgentId,
        reason: &str,
    ) -> Result<u64, RollbackError> {
        let snapshot = self
            .vault
            .latest(agent_id)
            .await
            .ok_or_else(|| RollbackError::NoSnapshot(agent_id.clone()))?;
        self.revert_to(&snapshot, reason).await
    }

    /// Manual rollback of a previously-applied proposal.
    pub async fn revert_proposal(&self, proposal_id: ProposalId) -> Result<u64, RollbackError> {
        let snapshot = self
            .vault
            .for_proposal(proposal_id)
            .await
            .ok_or(RollbackError::NoProposalSnapshot(proposal_id))?;
        self.revert_to(&snapshot, &format!("proposal {proposal_id} reverted"))
            .await
    }

    /// Check a verification window and revert on regression. Returns the
    /// regression report when a rollback was performed.
    pub async fn revert_on_regression(
        &self,
        agent_id: &AgentId,
        baseline: &MetricsSnapshot,
        since_ms: i64,
        proposal_id: Option<ProposalId>,
    ) -> Result<Option<RegressionReport>, RollbackError> {
        let Some(report) = self.check_regression(agent_id, baseline, since_ms).await else {
            return Ok(None);
        };

        let snapshot = match proposal_id {
            Some(id) => self.vault.for_proposal(id).await,
            None => self.vault.latest(agent_id).await,
        }
        .ok_or_else(|| RollbackError::NoSnapshot(agent_id.clone()))?;

        self.revert_to(
            &snapshot,
            &format!(
                "regression: success drop {:.2}, duration increase {:.2}",
                report.success_drop, report.duration_increase
            ),
        )
        .await?;
        Ok(Some(report))
    }

    pub fn vault(&self) -> Arc<SnapshotVault> {
        self.vault.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }
}
