//! Plan domain model.
//!
//! A plan is a dependency DAG of tasks sharing one parent description. The
//! planner only structures work; execution belongs to the scheduler.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::task::{Task, TaskId, TaskStatus};

/// Unique identifier for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How subtasks of a plan relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStrategy {
    /// Each subtask depends on the previous one.
    Sequential,
    /// All subtasks are independent.
    Parallel,
    /// Arbitrary explicit dependency graph.
    Dag,
    /// Strategy chosen by a heuristic at decomposition time.
    Auto,
}

impl PlanStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Dag => "dag",
            Self::Auto => "auto",
        }
    }
}

/// Validation errors for plan construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no subtasks")]
    Empty,

    #[error("subtask {0} depends on {1}, which is not part of the plan")]
    ForeignDependency(TaskId, TaskId),

    #[error("dependency cycle involving task {0}")]
    Cycle(TaskId),
}

/// Derived status of a plan, reduced from its subtask statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A dependency DAG of tasks sharing a parent description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub original_description: String,
    /// The resolved strategy; `Auto` never survives decomposition.
    pub strategy: PlanStrategy,
    pub subtasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(
        description: impl Into<String>,
        strategy: PlanStrategy,
        subtasks: Vec<Task>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, PlanError> {
        let plan = Self {
            id: PlanId::new(),
            original_description: description.into(),
            strategy,
            subtasks,
            created_at,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Check the plan invariants: non-empty, dependencies stay inside the
    /// plan, and the dependency graph is acyclic.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.subtasks.is_empty() {
            return Err(PlanError::Empty);
        }

        let members: HashSet<TaskId> = self.subtasks.iter().map(|t| t.id).collect();
        for task in &self.subtasks {
            for dep in &task.dependencies {
                if !members.contains(dep) {
                    return Err(PlanError::ForeignDependency(task.id, *dep));
                }
            }
        }

        // Kahn's algorithm; leftover nodes mean a cycle.
        let mut in_degree: HashMap<TaskId, usize> = self
            .subtasks
            .iter()
            .map(|t| (t.id, t.dependencies.len()))
            .collect();
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in &self.subtasks {
            for dep in &task.dependencies {
                dependents.entry(*dep).or_default().push(task.id);
            }
        }

        let mut ready: Vec<TaskId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = ready.pop() {
            visited += 1;
            if let Some(children) = dependents.get(&id) {
                for child in children {
                    let entry = in_degree.get_mut(child).map(|d| {
                        *d -= 1;
                        *d
                    });
                    if entry == Some(0) {
                        ready.push(*child);
                    }
                }
            }
        }

        if visited != self.subtasks.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .unwrap_or_else(|| self.subtasks[0].id);
            return Err(PlanError::Cycle(stuck));
        }
        Ok(())
    }

    /// Reduce subtask statuses to a plan status.
    pub fn status_from(statuses: &HashMap<TaskId, TaskStatus>, subtask_ids: &[TaskId]) -> PlanStatus {
        let mut any_running = false;
        let mut any_failed = false;
        let mut any_cancelled = false;
        let mut all_completed = true;

        for id in subtask_ids {
            match statuses.get(id) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed | TaskStatus::TimedOut) => {
                    any_failed = true;
                    all_completed = false;
                }
                Some(TaskStatus::Cancelled) => {
                    any_cancelled = true;
                    all_completed = false;
                }
                Some(TaskStatus::Running) => {
                    any_running = true;
                    all_completed = false;
                }
                _ => all_completed = false,
            }
        }

        if all_completed {
            PlanStatus::Completed
        } else if any_failed {
            PlanStatus::Failed
        } else if any_cancelled {
            PlanStatus::Cancelled
        } else if any_running {
            PlanStatus::Running
        } else {
            PlanStatus::Pending
        }
    }

    pub fn subtask_ids(&self) -> Vec<TaskId> {
        self.subtasks.iter().map(|t| t.id).collect()
    }
}
