//! Change proposal domain model.
//!
//! The self-improving loop never mutates agent configuration directly: it
//! produces a proposal that advances through quality gates and is applied,
//! rejected, or reverted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::agent::AgentId;
use super::playbook::RiskClass;

/// Unique identifier for a change proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(pub Uuid);

impl ProposalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProposalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a proposal. Terminal states are `Rejected`, `Applied`
/// (after successful verification), and `Reverted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    /// Waiting on out-of-band human approval (L2).
    Gated,
    Approved,
    Rejected,
    Applied,
    Reverted,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Gated => "gated",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Applied => "applied",
            Self::Reverted => "reverted",
        }
    }
}

/// Quality gate levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateLevel {
    /// Syntactic / schema validation of the diff.
    L0,
    /// Regression replay or predicted-metric comparison.
    L1,
    /// Human approval.
    L2,
}

impl GateLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L0 => "L0",
            Self::L1 => "L1",
            Self::L2 => "L2",
        }
    }
}

/// One field changed by a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub from: Value,
    pub to: Value,
}

impl FieldChange {
    pub fn new(field: impl Into<String>, from: impl Into<Value>, to: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Aggregate agent metrics captured before and after a change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub sample_count: usize,
}

impl MetricsSnapshot {
    /// Drop in success rate going from `self` to `after` (positive = worse).
    pub fn success_drop(&self, after: &Self) -> f64 {
        self.success_rate - after.success_rate
    }

    /// Relative increase in average duration (positive = slower).
    pub fn duration_increase(&self, after: &Self) -> f64 {
        if self.avg_duration_ms <= 0.0 {
            return 0.0;
        }
        (after.avg_duration_ms - self.avg_duration_ms) / self.avg_duration_ms
    }
}

/// A proposed, gated, applied-or-reverted mutation of an agent's
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeProposal {
    pub id: ProposalId,
    pub target_agent: AgentId,
    /// Config version the diff was computed against.
    pub target_version: u64,
    pub diff: Vec<FieldChange>,
    pub justification: String,
    pub risk_class: RiskClass,
    pub status: ProposalStatus,
    pub metrics_before: MetricsSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_after: Option<MetricsSnapshot>,
    /// Which gate rejected the proposal, when status is `Rejected`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_gate: Option<GateLevel>,
    /// Config version produced when the proposal was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_version: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl ChangeProposal {
    pub fn new(
        target_agent: AgentId,
        target_version: u64,
        diff: Vec<FieldChange>,
        justification: impl Into<String>,
        risk_class: RiskClass,
        metrics_before: MetricsSnapshot,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ProposalId::new(),
            target_agent,
            target_version,
            diff,
            justification: justification.into(),
            risk_class,
            status: ProposalStatus::Draft,
            metrics_before,
            metrics_after: None,
            failed_gate: None,
            applied_version: None,
            created_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ProposalStatus::Rejected | ProposalStatus::Reverted
        )
    }
}
