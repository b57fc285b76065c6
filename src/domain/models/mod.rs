//! Domain models: pure data types shared across the control plane.

pub mod agent;
pub mod event;
pub mod health;
pub mod plan;
pub mod playbook;
pub mod proposal;
pub mod task;
pub mod trace;

pub use agent::{AgentConfig, AgentId, AgentPatch, AgentStatsSnapshot, Env, ThinkingLevel};
pub use event::{Event, EventId, EventPattern, EventSeverity, EventType, EventTypeError};
pub use health::{HealthReport, QueueStatus};
pub use plan::{Plan, PlanError, PlanId, PlanStatus, PlanStrategy};
pub use playbook::{
    ActionDescriptor, ActionKind, Condition, Playbook, PlaybookError, PlaybookId, RiskClass,
    Trigger, VerifySpec,
};
pub use proposal::{
    ChangeProposal, FieldChange, GateLevel, MetricsSnapshot, ProposalId, ProposalStatus,
};
pub use task::{Task, TaskId, TaskOutcome, TaskPriority, TaskSpec, TaskStatus};
pub use trace::{ErrorSignature, Trace, TraceContext, TraceId};
