//! Heuristic task decomposition.
//!
//! The planner turns a high-level description into a plan: an ordered list
//! of subtasks with explicit dependencies. It only structures work — the
//! scheduler executes it. The default strategy is a cheap heuristic over the
//! description text; explicit DAGs come in through `plan_from_specs`.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};

use crate::domain::models::task::task_types;
use crate::domain::models::{Plan, PlanError, PlanStrategy, Task, TaskSpec};
use crate::domain::ports::Clock;
use crate::services::event_store::{EventStore, Stream, StoreError};

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("empty description")]
    EmptyDescription,

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ordering markers that push the auto heuristic toward sequential plans.
const ORDERING_MARKERS: [&str; 5] = [" then ", " after ", "first,", "finally", "step "];

/// Stateless decomposition service; persists each produced plan.
pub struct Planner {
    store: Arc<EventStore>,
    clock: Arc<dyn Clock>,
}

impl Planner {
    pub fn new(store: Arc<EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Decompose a description into a plan using the given strategy.
    #[instrument(skip(self, description))]
    pub async fn decompose(
        &self,
        description: &str,
        strategy: PlanStrategy,
    ) -> Result<Plan, PlannerError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(PlannerError::EmptyDescription);
        }

        let steps = split_steps(description);
        let strategy = match strategy {
            PlanStrategy::Auto => choose_strategy(description, steps.len()),
            other => other,
        };

        let mut subtasks: Vec<Task> = Vec::with_capacity(steps.len());
        for step in &steps {
            let spec = TaskSpec::new(infer_task_type(step), step.clone());
            let mut task = Task::from_spec(spec, self.clock.now());
            match strategy {
                PlanStrategy::Sequential => {
                    if let Some(prev) = subtasks.last() {
                        task.dependencies.insert(prev.id);
                    }
                }
                // Parallel subtasks depend on nothing. The heuristic cannot
                // invent an arbitrary graph, so a Dag request without
                // explicit specs degrades to the sequential chain.
                PlanStrategy::Parallel => {}
                PlanStrategy::Dag => {
                    if let Some(prev) = subtasks.last() {
                        task.dependencies.insert(prev.id);
                    }
                }
                PlanStrategy::Auto => unreachable!("auto resolved above"),
            }
            subtasks.push(task);
        }

        self.finish(description, strategy, subtasks).await
    }

    /// Build a plan from explicit subtask specs; each entry lists the indexes
    /// of the specs it depends on. This is the path for real DAGs.
    pub async fn plan_from_specs(
        &self,
        description: &str,
        specs: Vec<(TaskSpec, Vec<usize>)>,
    ) -> Result<Plan, PlannerError> {
        let now = self.clock.now();
        let mut tasks: Vec<Task> = specs
            .iter()
            .map(|(spec, _)| Task::from_spec(spec.clone(), now))
            .collect();
        let ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
        for (task, (_, deps)) in tasks.iter_mut().zip(specs.iter()) {
            for idx in deps {
                if let Some(dep_id) = ids.get(*idx) {
                    task.dependencies.insert(*dep_id);
                }
            }
        }
        self.finish(description, PlanStrategy::Dag, tasks).await
    }

    async fn finish(
        &self,
        description: &str,
        strategy: PlanStrategy,
        subtasks: Vec<Task>,
    ) -> Result<Plan, PlannerError> {
        let mut plan = Plan::new(description, strategy, subtasks, self.clock.now())?;
        let plan_id = plan.id;
        for task in &mut plan.subtasks {
            task.parent_plan = Some(plan_id);
        }
        self.store.append(Stream::Plans, &plan, true).await?;
        info!(
            plan = %plan.id,
            strategy = strategy.as_str(),
            subtasks = plan.subtasks.len(),
            "plan created"
        );
        Ok(plan)
    }
}

/// Split a description into candidate steps on explicit separators.
fn split_steps(description: &str) -> Vec<String> {
    let mut steps: Vec<String> = description
        .split(" then ")
        .flat_map(|part| part.split(';'))
        .flat_map(|part| part.split('\n'))
        .map(|s| s.trim().trim_start_matches(['-', '*', ' ']).to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if steps.is_empty() {
        steps.push(description.to_string());
    }
    steps
}

/// Pick a strategy from description shape: ordering markers force a chain,
/// multiple independent steps run in parallel, one step stays alone.
fn choose_strategy(description: &str, step_count: usize) -> PlanStrategy {
    let lowered = description.to_lowercase();
    if ORDERING_MARKERS.iter().any(|m| lowered.contains(m)) {
        return PlanStrategy::Sequential;
    }
    if step_count > 1 {
        PlanStrategy::Parallel
    } else {
        PlanStrategy::Sequential
    }
}

/// Keyword inference of the task type for one step.
fn infer_task_type(step: &str) -> &'static str {
    let lowered = step.to_lowercase();
    let rules: [(&[&str], &str); 7] = [
        (&["review", "audit"], task_types::REVIEW),
        (&["test", "verify", "validate"], task_types::TEST),
        (&["monitor", "watch", "observe"], task_types::MONITOR),
        (&["research", "investigate", "explore"], task_types::RESEARCH),
        (&["design", "architect", "sketch"], task_types::DESIGN),
        (&["fix", "repair", "debug", "patch"], task_types::FIX),
        (&["analyze", "analysis", "profile", "measure"], task_types::ANALYSIS),
    ];
    for (keywords, task_type) in rules {
        if keywords.iter().any(|k| lowered.contains(k)) {
            return task_type;
        }
    }
    task_types::CODE
}
