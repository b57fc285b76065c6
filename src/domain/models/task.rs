//! Task domain model.
//!
//! Tasks are discrete units of work routed to agents. They carry priority,
//! retry budget, timeout, and an explicit dependency set so they can form a
//! DAG under a parent plan.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::agent::{AgentId, Env};
use super::plan::PlanId;
use super::trace::{ErrorSignature, TraceId};

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority level for tasks. `P0` is most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    P0,
    P1,
    P2,
    P3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::P2
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "P0" | "CRITICAL" => Some(Self::P0),
            "P1" | "HIGH" => Some(Self::P1),
            "P2" | "NORMAL" => Some(Self::P2),
            "P3" | "LOW" => Some(Self::P3),
            _ => None,
        }
    }
}

/// Status of a task in the scheduling pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued and runnable as soon as a worker frees up.
    Queued,
    /// Held back by uncompleted dependencies.
    Blocked,
    /// Currently executing on an agent.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully after exhausting retries.
    Failed,
    /// Cancelled by the operator or by a failed dependency.
    Cancelled,
    /// Final attempt ended on the watchdog deadline.
    TimedOut,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Blocked => "blocked",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Queued => &[Self::Running, Self::Blocked, Self::Cancelled],
            Self::Blocked => &[Self::Queued, Self::Cancelled, Self::Failed],
            Self::Running => &[
                // Failed attempts with retry budget left re-enter the queue.
                Self::Queued,
                Self::Completed,
                Self::Failed,
                Self::Cancelled,
                Self::TimedOut,
            ],
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Well-known task type names. The set is open: installations may define
/// additional types, these are the ones the core and its routing defaults
/// know about.
pub mod task_types {
    pub const CODE: &str = "code";
    pub const ANALYSIS: &str = "analysis";
    pub const MONITOR: &str = "monitor";
    pub const RESEARCH: &str = "research";
    pub const DESIGN: &str = "design";
    pub const FIX: &str = "fix";
    pub const REVIEW: &str = "review";
    pub const TEST: &str = "test";
}

/// Operator- or planner-supplied description of work to submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_type: String,
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: HashSet<TaskId>,
    #[serde(default = "TaskSpec::default_max_retries")]
    pub max_retries: u32,
    /// Explicit execution timeout in milliseconds. When absent the agent's
    /// default (possibly adapted from recent traces) applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Explicit agent assignment; wins over all routing policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<AgentId>,
    #[serde(default)]
    pub env: Env,
}

impl TaskSpec {
    fn default_max_retries() -> u32 {
        2
    }

    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            description: description.into(),
            priority: TaskPriority::default(),
            deadline: None,
            dependencies: HashSet::new(),
            max_retries: Self::default_max_retries(),
            timeout_ms: None,
            assigned_agent: None,
            env: Env::default(),
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.dependencies.insert(id);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn assigned_agent(mut self, agent: AgentId) -> Self {
        self.assigned_agent = Some(agent);
        self
    }

    pub fn env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }
}

/// Outcome recorded on a task once it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_signature: Option<ErrorSignature>,
    /// One trace per attempt, in attempt order.
    #[serde(default)]
    pub trace_ids: Vec<TraceId>,
}

/// A scheduled unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub description: String,
    pub priority: TaskPriority,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: HashSet<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_plan: Option<PlanId>,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub attempt: u32,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<AgentId>,
    /// Explicit operator assignment, preserved separately from the agent the
    /// router ultimately picked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_override: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskOutcome>,
    #[serde(default)]
    pub env: Env,
}

impl Task {
    pub fn from_spec(spec: TaskSpec, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            task_type: spec.task_type,
            description: spec.description,
            priority: spec.priority,
            submitted_at,
            deadline: spec.deadline,
            dependencies: spec.dependencies,
            parent_plan: None,
            max_retries: spec.max_retries,
            timeout_ms: spec.timeout_ms,
            attempt: 0,
            status: TaskStatus::Queued,
            assigned_agent: None,
            assignment_override: spec.assigned_agent,
            result: None,
            env: spec.env,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Remaining attempts including the current one.
    pub fn retries_left(&self) -> u32 {
        (self.max_retries + 1).saturating_sub(self.attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::P0 < TaskPriority::P1);
        assert!(TaskPriority::P1 < TaskPriority::P3);
        assert_eq!(TaskPriority::from_str("critical"), Some(TaskPriority::P0));
        assert_eq!(TaskPriority::from_str("p2"), Some(TaskPriority::P2));
        assert_eq!(TaskPriority::from_str("urgent"), None);
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::TimedOut.is_terminal());
    }

    #[test]
    fn test_task_from_spec() {
        let dep = TaskId::new();
        let spec = TaskSpec::new("code", "implement feature")
            .priority(TaskPriority::P1)
            .depends_on(dep)
            .max_retries(1)
            .timeout(Duration::from_secs(30));
        let task = Task::from_spec(spec, Utc::now());

        assert_eq!(task.priority, TaskPriority::P1);
        assert!(task.dependencies.contains(&dep));
        assert_eq!(task.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt, 0);
        assert_eq!(task.retries_left(), 2);
    }
}
