//! Priority scheduler with a bounded worker pool.
//!
//! Tasks queue on `(priority, submitted_at)` with FIFO tie-break; at most
//! `workers` run concurrently. Tasks with unmet dependencies wait in the
//! blocked set until completion events release them; failed dependencies
//! cancel (or, configurably, fail) their dependents. Failed attempts with a
//! retryable signature re-enter the queue with exponential backoff. Every
//! state change is journaled to the `task_queue` stream so a restart can
//! recover the queue and declare orphaned running tasks lost.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::models::event::event_types;
use crate::domain::models::{
    ErrorSignature, EventSeverity, Plan, QueueStatus, Task, TaskId, TaskOutcome, TaskPriority,
    TaskSpec, TaskStatus,
};
use crate::domain::ports::Clock;
use crate::services::dispatcher::Dispatcher;
use crate::services::event_bus::{core_event, EventBus};
use crate::services::event_store::{EventStore, Stream, StoreError};
use crate::services::router::Router;
use crate::services::trace_recorder::TraceRecorder;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size: the concurrency cap.
    pub workers: usize,
    /// Base delay for the first retry.
    pub retry_base: Duration,
    /// Cap for the exponential retry delay.
    pub retry_cap: Duration,
    /// Runtime errors retry at most this many times regardless of the task
    /// budget; a conservative default since the source of a runtime error
    /// rarely heals on its own.
    pub runtime_retry_cap: u32,
    /// When true, a failed dependency fails its dependents instead of
    /// cancelling them.
    pub bubble_failure: bool,
    /// Minimum successful samples before the adaptive timeout kicks in.
    pub adaptive_min_samples: usize,
    /// How many recent traces feed the adaptive timeout.
    pub adaptive_window: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(60),
            runtime_retry_cap: 1,
            bubble_failure: false,
            adaptive_min_samples: 5,
            adaptive_window: 20,
        }
    }
}

/// Submission errors, surfaced to the submitter immediately.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid task spec: {0}")]
    InvalidSpec(String),

    #[error("dependency {0} does not exist")]
    UnknownDependency(TaskId),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct QueueEntry {
    priority: TaskPriority,
    submitted_ms: i64,
    seq: u64,
    task_id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap pops the max; invert so P0/oldest/first-submitted wins.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.submitted_ms.cmp(&self.submitted_ms))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct SchedState {
    queue: BinaryHeap<QueueEntry>,
    /// Live tasks: queued, blocked, or running.
    tasks: HashMap<TaskId, Task>,
    /// Blocked task → unmet dependency ids.
    unmet: HashMap<TaskId, HashSet<TaskId>>,
    /// Dependency → tasks waiting on it.
    dependents: HashMap<TaskId, HashSet<TaskId>>,
    running: HashMap<TaskId, CancellationToken>,
    /// Terminal statuses, retained for dependency checks and projections.
    terminal: HashMap<TaskId, TaskStatus>,
    seq: u64,
}

/// Priority queue + worker pool.
pub struct Scheduler {
    state: Mutex<SchedState>,
    semaphore: Arc<Semaphore>,
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    traces: Arc<TraceRecorder>,
    bus: Arc<EventBus>,
    store: Arc<EventStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        router: Arc<Router>,
        dispatcher: Arc<Dispatcher>,
        traces: Arc<TraceRecorder>,
        bus: Arc<EventBus>,
        store: Arc<EventStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let workers = config.workers.max(1);
        Arc::new(Self {
            state: Mutex::new(SchedState::default()),
            semaphore: Arc::new(Semaphore::new(workers)),
            router,
            dispatcher,
            traces,
            bus,
            store,
            clock,
            config,
        })
    }

    async fn journal(&self, task: &Task) {
        if let Err(e) = self.store.append(Stream::TaskQueue, task, true).await {
            warn!(task = %task.id, error = %e, "failed to journal task state");
        }
    }

    async fn emit_task_event(&self, event_type: &str, task: &Task, severity: EventSeverity) {
        let event = core_event(event_type, "scheduler", severity)
            .with_task(task.id)
            .with_field("task_type", task.task_type.clone())
            .with_field("priority", task.priority.as_str())
            .with_field("attempt", task.attempt);
        let _ = self.bus.emit(event).await;
    }

    /// Submit a task spec. Validation failures reject immediately with
    /// `task.rejected`; accepted tasks are journaled and queued or blocked.
    #[instrument(skip(self, spec), fields(task_type = %spec.task_type))]
    pub async fn submit(self: &Arc<Self>, spec: TaskSpec) -> Result<TaskId, SchedulerError> {
        if spec.task_type.trim().is_empty() {
            self.reject("empty task type", None).await;
            return Err(SchedulerError::InvalidSpec("empty task type".to_string()));
        }
        if spec.description.trim().is_empty() {
            self.reject("empty description", None).await;
            return Err(SchedulerError::InvalidSpec("empty description".to_string()));
        }
        let task = Task::from_spec(spec, self.clock.now());
        self.enqueue(task).await
    }

    async fn reject(&self, reason: &str, task_id: Option<TaskId>) {
        let mut event = core_event(event_types::TASK_REJECTED, "scheduler", EventSeverity::Warning)
            .with_field("reason", reason)
            .with_field("error_signature", ErrorSignature::InvalidTaskSpec.wire());
        if let Some(id) = task_id {
            event = event.with_task(id);
        }
        let _ = self.bus.emit(event).await;
    }

    /// Submit all subtasks of a plan, preserving their dependency edges.
    pub async fn submit_plan(self: &Arc<Self>, plan: &Plan) -> Result<Vec<TaskId>, SchedulerError> {
        let mut ids = Vec::with_capacity(plan.subtasks.len());
        for task in &plan.subtasks {
            ids.push(self.enqueue(task.clone()).await?);
        }
        Ok(ids)
    }

    /// Place a fully-formed task into the queue or blocked set.
    async fn enqueue(self: &Arc<Self>, mut task: Task) -> Result<TaskId, SchedulerError> {
        let task_id = task.id;
        {
            let state = self.state.lock().await;
            for dep in &task.dependencies {
                let known = state.tasks.contains_key(dep)
                    || state.terminal.contains_key(dep)
                    || task.parent_plan.is_some();
                if !known {
                    return Err(SchedulerError::UnknownDependency(*dep));
                }
            }
        }

        self.emit_task_event(event_types::TASK_SUBMITTED, &task, EventSeverity::Info)
            .await;

        {
            let mut state = self.state.lock().await;
            let unmet: HashSet<TaskId> = task
                .dependencies
                .iter()
                .filter(|dep| state.terminal.get(dep) != Some(&TaskStatus::Completed))
                .copied()
                .collect();
            let failed_dep = unmet
                .iter()
                .any(|dep| state.terminal.get(dep).is_some_and(|s| s.is_terminal()));

            if failed_dep {
                task.status = TaskStatus::Cancelled;
                state.terminal.insert(task_id, TaskStatus::Cancelled);
            } else if unmet.is_empty() {
                task.status = TaskStatus::Queued;
                let entry = QueueEntry {
                    priority: task.priority,
                    submitted_ms: task.submitted_at.timestamp_millis(),
                    seq: state.seq,
                    task_id,
                };
                state.seq += 1;
                state.queue.push(entry);
                state.tasks.insert(task_id, task.clone());
            } else {
                task.status = TaskStatus::Blocked;
                for dep in &unmet {
                    state.dependents.entry(*dep).or_default().insert(task_id);
                }
                state.unmet.insert(task_id, unmet);
                state.tasks.insert(task_id, task.clone());
            }
        }

        self.journal(&task).await;
        match task.status {
            TaskStatus::Cancelled => {
                self.emit_task_event(event_types::TASK_CANCELLED, &task, EventSeverity::Warning)
                    .await;
            }
            TaskStatus::Blocked => {
                self.emit_task_event(event_types::TASK_BLOCKED, &task, EventSeverity::Info)
                    .await;
            }
            _ => {
                self.emit_task_event(event_types::TASK_QUEUED, &task, EventSeverity::Info)
                    .await;
                self.pump();
            }
        }
        Ok(task_id)
    }

    /// Pull runnable tasks up to the concurrency cap. Cheap to call; invoked
    /// on submit, completion, retry expiry, and every heartbeat tick.
    pub fn pump(self: &Arc<Self>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let Ok(permit) = scheduler.semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let Some(task) = scheduler.next_runnable().await else {
                    break;
                };
                let runner = scheduler.clone();
                tokio::spawn(async move {
                    runner.run(task, permit).await;
                });
            }
        });
    }

    async fn next_runnable(&self) -> Option<Task> {
        let mut state = self.state.lock().await;
        loop {
            let entry = state.queue.pop()?;
            // Stale entries (cancelled or re-queued tasks) are skipped.
            let runnable = state
                .tasks
                .get(&entry.task_id)
                .is_some_and(|t| t.status == TaskStatus::Queued);
            if !runnable {
                continue;
            }
            let task = state.tasks.get_mut(&entry.task_id)?;
            task.status = TaskStatus::Running;
            task.attempt += 1;
            let result = task.clone();
            let token = CancellationToken::new();
            state.running.insert(entry.task_id, token);
            return Some(result);
        }
    }

    #[instrument(skip(self, task, _permit), fields(task = %task.id, attempt = task.attempt))]
    async fn run(self: Arc<Self>, task: Task, _permit: OwnedSemaphorePermit) {
        self.journal(&task).await;
        self.emit_task_event(event_types::TASK_STARTED, &task, EventSeverity::Info)
            .await;

        let route = match self.router.route(&task).await {
            Ok(route) => route,
            Err(e) => {
                let signature = e.signature();
                debug!(task = %task.id, error = %e, "routing failed");
                self.finalize_failure(task, signature, Vec::new()).await;
                return;
            }
        };

        let timeout = self.effective_timeout(&task, &route.agent).await;
        let cancel = {
            let state = self.state.lock().await;
            state.running.get(&task.id).cloned().unwrap_or_default()
        };

        let outcome = self
            .dispatcher
            .dispatch(&task, route.agent, route.policy, timeout, cancel)
            .await;

        let mut task = {
            let mut state = self.state.lock().await;
            state.running.remove(&task.id);
            match state.tasks.get(&task.id) {
                Some(live) => live.clone(),
                None => return, // cancelled and removed concurrently
            }
        };
        let mut trace_ids = task
            .result
            .as_ref()
            .map(|r| r.trace_ids.clone())
            .unwrap_or_default();
        trace_ids.push(outcome.trace_id);

        if outcome.cancelled {
            self.finalize_cancelled(task).await;
            return;
        }

        if outcome.success {
            task.result = Some(TaskOutcome {
                success: true,
                output: outcome.output,
                error_signature: None,
                trace_ids,
            });
            self.finalize_success(task).await;
            return;
        }

        let signature = outcome.signature.unwrap_or(ErrorSignature::Other);
        if self.should_retry(&task, &signature) {
            self.schedule_retry(task, &signature, trace_ids).await;
        } else {
            task.result = Some(TaskOutcome {
                success: false,
                output: outcome.output,
                error_signature: Some(signature.clone()),
                trace_ids,
            });
            self.finalize_failure(task, signature, Vec::new()).await;
        }
    }

    fn should_retry(&self, task: &Task, signature: &ErrorSignature) -> bool {
        if task.attempt >= task.max_retries + 1 {
            return false;
        }
        if signature.is_retryable() {
            return true;
        }
        // Runtime errors get a small independent cap.
        signature.is_runtime() && task.attempt <= self.config.runtime_retry_cap
    }

    async fn schedule_retry(
        self: &Arc<Self>,
        mut task: Task,
        signature: &ErrorSignature,
        trace_ids: Vec<crate::domain::models::TraceId>,
    ) {
        let delay = self.retry_delay(task.attempt);
        task.status = TaskStatus::Queued;
        task.result = Some(TaskOutcome {
            success: false,
            output: None,
            error_signature: Some(signature.clone()),
            trace_ids,
        });
        {
            let mut state = self.state.lock().await;
            state.tasks.insert(task.id, task.clone());
        }
        self.journal(&task).await;

        let event = core_event(
            event_types::SCHEDULER_RETRY_SCHEDULED,
            "scheduler",
            EventSeverity::Warning,
        )
        .with_task(task.id)
        .with_field("attempt", task.attempt)
        .with_field("max_retries", task.max_retries)
        .with_field("delay_ms", delay.as_millis() as u64)
        .with_field("error_signature", signature.wire());
        let _ = self.bus.emit(event).await;

        info!(task = %task.id, attempt = task.attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");

        let scheduler = self.clone();
        let task_id = task.id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = scheduler.state.lock().await;
                let Some(live) = state.tasks.get(&task_id) else {
                    return;
                };
                if live.status != TaskStatus::Queued {
                    return;
                }
                let entry = QueueEntry {
                    priority: live.priority,
                    submitted_ms: live.submitted_at.timestamp_millis(),
                    seq: state.seq,
                    task_id,
                };
                state.seq += 1;
                state.queue.push(entry);
            }
            scheduler.pump();
        });
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let mut policy = backoff::ExponentialBackoff {
            initial_interval: self.config.retry_base,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.config.retry_cap,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut delay = self.config.retry_base;
        for _ in 0..attempt.saturating_sub(1) {
            if let Some(next) = policy.next_backoff() {
                delay = next;
            }
        }
        delay.min(self.config.retry_cap)
    }

    /// Explicit task timeout, else the adaptive per-(agent, type) estimate,
    /// else the agent default. The deadline further bounds whatever wins.
    async fn effective_timeout(
        &self,
        task: &Task,
        agent: &crate::domain::models::AgentConfig,
    ) -> Duration {
        let mut timeout = match task.timeout() {
            Some(explicit) => explicit,
            None => {
                let base = agent.default_timeout();
                self.adaptive_timeout(task, agent).await.unwrap_or(base)
            }
        };
        if let Some(deadline) = task.deadline {
            let remaining = (deadline - self.clock.now()).num_milliseconds().max(0) as u64;
            timeout = timeout.min(Duration::from_millis(remaining.max(1)));
        }
        timeout
    }

    /// p95 of recent successful durations × 1.2, substituted when it drifts
    /// more than 20% from the configured default.
    async fn adaptive_timeout(
        &self,
        task: &Task,
        agent: &crate::domain::models::AgentConfig,
    ) -> Option<Duration> {
        let mut durations = self
            .traces
            .successful_durations(&agent.id, &task.task_type, self.config.adaptive_window)
            .await;
        if durations.len() < self.config.adaptive_min_samples {
            return None;
        }
        durations.sort_unstable();
        let idx = ((durations.len() as f64) * 0.95).ceil() as usize - 1;
        let p95 = durations[idx.min(durations.len() - 1)];
        let candidate = (p95 as f64 * 1.2) as u64;
        let base = agent.timeout_default_ms;
        let drift = (candidate as f64 - base as f64).abs() / base as f64;
        (drift > 0.20).then(|| Duration::from_millis(candidate.max(1)))
    }

    async fn finalize_success(self: &Arc<Self>, mut task: Task) {
        task.status = TaskStatus::Completed;
        let released = {
            let mut state = self.state.lock().await;
            state.tasks.remove(&task.id);
            state.terminal.insert(task.id, TaskStatus::Completed);
            self.release_dependents(&mut state, task.id)
        };
        self.journal(&task).await;
        self.emit_task_event(event_types::TASK_SUCCEEDED, &task, EventSeverity::Info)
            .await;
        for released_task in released {
            self.journal(&released_task).await;
            self.emit_task_event(event_types::TASK_QUEUED, &released_task, EventSeverity::Info)
                .await;
        }
        self.pump();
    }

    /// Move dependents whose last dependency just completed into the queue.
    fn release_dependents(&self, state: &mut SchedState, completed: TaskId) -> Vec<Task> {
        let mut released = Vec::new();
        let Some(waiting) = state.dependents.remove(&completed) else {
            return released;
        };
        for dependent in waiting {
            let now_ready = match state.unmet.get_mut(&dependent) {
                Some(unmet) => {
                    unmet.remove(&completed);
                    unmet.is_empty()
                }
                None => false,
            };
            if !now_ready {
                continue;
            }
            state.unmet.remove(&dependent);
            if let Some(task) = state.tasks.get_mut(&dependent) {
                if task.status == TaskStatus::Blocked {
                    task.status = TaskStatus::Queued;
                    let entry = QueueEntry {
                        priority: task.priority,
                        submitted_ms: task.submitted_at.timestamp_millis(),
                        seq: state.seq,
                        task_id: dependent,
                    };
                    state.seq += 1;
                    state.queue.push(entry);
                    released.push(task.clone());
                }
            }
        }
        released
    }

    async fn finalize_failure(
        self: &Arc<Self>,
        mut task: Task,
        signature: ErrorSignature,
        extra_trace_ids: Vec<crate::domain::models::TraceId>,
    ) {
        let status = if signature == ErrorSignature::Timeout {
            TaskStatus::TimedOut
        } else {
            TaskStatus::Failed
        };
        task.status = status;
        if task.result.is_none() {
            task.result = Some(TaskOutcome {
                success: false,
                output: None,
                error_signature: Some(signature.clone()),
                trace_ids: extra_trace_ids,
            });
        }

        let cascade = {
            let mut state = self.state.lock().await;
            state.tasks.remove(&task.id);
            state.running.remove(&task.id);
            state.terminal.insert(task.id, status);
            self.collect_cascade(&mut state, task.id)
        };

        self.journal(&task).await;
        let trace_chain: Vec<String> = task
            .result
            .as_ref()
            .map(|r| r.trace_ids.iter().map(ToString::to_string).collect())
            .unwrap_or_default();
        let event = core_event(event_types::TASK_FAILED, "scheduler", EventSeverity::Error)
            .with_task(task.id)
            .with_field("error_signature", signature.wire())
            .with_field("attempt", task.attempt)
            .with_field("trace_ids", serde_json::json!(trace_chain));
        let _ = self.bus.emit(event).await;

        for mut dependent in cascade {
            if self.config.bubble_failure {
                dependent.status = TaskStatus::Failed;
                self.journal(&dependent).await;
                let event =
                    core_event(event_types::TASK_FAILED, "scheduler", EventSeverity::Error)
                        .with_task(dependent.id)
                        .with_field("error_signature", signature.wire())
                        .with_field("cascaded_from", task.id.to_string());
                let _ = self.bus.emit(event).await;
            } else {
                dependent.status = TaskStatus::Cancelled;
                self.journal(&dependent).await;
                let event = core_event(
                    event_types::TASK_CANCELLED,
                    "scheduler",
                    EventSeverity::Warning,
                )
                .with_task(dependent.id)
                .with_field("reason", "dependency_failed")
                .with_field("cascaded_from", task.id.to_string());
                let _ = self.bus.emit(event).await;
            }
        }
        self.pump();
    }

    /// Remove all transitive dependents of a failed task from live state.
    fn collect_cascade(&self, state: &mut SchedState, failed: TaskId) -> Vec<Task> {
        let terminal_status = if self.config.bubble_failure {
            TaskStatus::Failed
        } else {
            TaskStatus::Cancelled
        };
        let mut cascade = Vec::new();
        let mut frontier = vec![failed];
        while let Some(current) = frontier.pop() {
            let Some(waiting) = state.dependents.remove(&current) else {
                continue;
            };
            for dependent in waiting {
                if let Some(task) = state.tasks.remove(&dependent) {
                    state.unmet.remove(&dependent);
                    state.terminal.insert(dependent, terminal_status);
                    cascade.push(task);
                    frontier.push(dependent);
                }
            }
        }
        cascade
    }

    async fn finalize_cancelled(self: &Arc<Self>, mut task: Task) {
        task.status = TaskStatus::Cancelled;
        {
            let mut state = self.state.lock().await;
            state.tasks.remove(&task.id);
            state.running.remove(&task.id);
            state.terminal.insert(task.id, TaskStatus::Cancelled);
        }
        self.journal(&task).await;
        self.emit_task_event(event_types::TASK_CANCELLED, &task, EventSeverity::Warning)
            .await;
        self.pump();
    }

    /// Cancel a queued, blocked, or running task.
    pub async fn cancel(self: &Arc<Self>, task_id: TaskId) -> Result<(), SchedulerError> {
        let cancelled_live = {
            let mut state = self.state.lock().await;
            if let Some(token) = state.running.get(&task_id) {
                // The in-flight run path observes the token and finalizes.
                token.cancel();
                None
            } else if let Some(mut task) = state.tasks.remove(&task_id) {
                state.unmet.remove(&task_id);
                state.terminal.insert(task_id, TaskStatus::Cancelled);
                task.status = TaskStatus::Cancelled;
                Some(task)
            } else if state.terminal.contains_key(&task_id) {
                None
            } else {
                return Err(SchedulerError::UnknownTask(task_id));
            }
        };

        if let Some(task) = cancelled_live {
            self.journal(&task).await;
            self.emit_task_event(event_types::TASK_CANCELLED, &task, EventSeverity::Warning)
                .await;
        }
        Ok(())
    }

    /// Queue occupancy projection.
    pub async fn queue_status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        let mut status = QueueStatus::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Queued => status.queued += 1,
                TaskStatus::Blocked => status.blocked += 1,
                TaskStatus::Running => status.running += 1,
                _ => {}
            }
        }
        for terminal in state.terminal.values() {
            match terminal {
                TaskStatus::Completed => status.completed += 1,
                TaskStatus::Failed | TaskStatus::TimedOut => status.failed += 1,
                TaskStatus::Cancelled => status.cancelled += 1,
                _ => {}
            }
        }
        status
    }

    pub async fn task_status(&self, task_id: TaskId) -> Option<TaskStatus> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(&task_id)
            .map(|t| t.status)
            .or_else(|| state.terminal.get(&task_id).copied())
    }

    /// Rebuild queue state from the journal after a restart. Tasks that were
    /// running when the process died are marked failed with `worker_lost`.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, SchedulerError> {
        let records = self.store.read::<Task>(Stream::TaskQueue, 0)?;
        let mut latest: HashMap<TaskId, Task> = HashMap::new();
        for stored in records {
            latest.insert(stored.record.id, stored.record);
        }

        let mut recovered = 0usize;
        let mut lost: Vec<Task> = Vec::new();
        {
            let mut state = self.state.lock().await;
            for (task_id, mut task) in latest {
                match task.status {
                    TaskStatus::Running => {
                        task.status = TaskStatus::Failed;
                        task.result = Some(TaskOutcome {
                            success: false,
                            output: None,
                            error_signature: Some(ErrorSignature::WorkerLost),
                            trace_ids: Vec::new(),
                        });
                        state.terminal.insert(task_id, TaskStatus::Failed);
                        lost.push(task);
                    }
                    TaskStatus::Queued => {
                        let entry = QueueEntry {
                            priority: task.priority,
                            submitted_ms: task.submitted_at.timestamp_millis(),
                            seq: state.seq,
                            task_id,
                        };
                        state.seq += 1;
                        state.queue.push(entry);
                        state.tasks.insert(task_id, task);
                        recovered += 1;
                    }
                    TaskStatus::Blocked => {
                        state.tasks.insert(task_id, task);
                        recovered += 1;
                    }
                    terminal => {
                        state.terminal.insert(task_id, terminal);
                    }
                }
            }

            // Recompute dependency edges for blocked tasks now that the
            // terminal map is complete.
            let blocked_ids: Vec<TaskId> = state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Blocked)
                .map(|t| t.id)
                .collect();
            for task_id in blocked_ids {
                let Some(deps) = state.tasks.get(&task_id).map(|t| t.dependencies.clone()) else {
                    continue;
                };
                let unmet: HashSet<TaskId> = deps
                    .into_iter()
                    .filter(|dep| state.terminal.get(dep) != Some(&TaskStatus::Completed))
                    .collect();
                if unmet.is_empty() {
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.status = TaskStatus::Queued;
                        let entry = QueueEntry {
                            priority: task.priority,
                            submitted_ms: task.submitted_at.timestamp_millis(),
                            seq: state.seq,
                            task_id,
                        };
                        state.seq += 1;
                        state.queue.push(entry);
                    }
                } else {
                    for dep in &unmet {
                        state.dependents.entry(*dep).or_default().insert(task_id);
                    }
                    state.unmet.insert(task_id, unmet);
                }
            }
        }

        for task in lost {
            self.journal(&task).await;
            let event = core_event(event_types::CORE_WORKER_LOST, "scheduler", EventSeverity::Error)
                .with_task(task.id)
                .with_field("error_signature", ErrorSignature::WorkerLost.wire());
            let _ = self.bus.emit(event).await;
            let failed = core_event(event_types::TASK_FAILED, "scheduler", EventSeverity::Error)
                .with_task(task.id)
                .with_field("error_signature", ErrorSignature::WorkerLost.wire());
            let _ = self.bus.emit(failed).await;
        }

        if recovered > 0 {
            info!(recovered, "task queue recovered from journal");
            self.pump();
        }
        Ok(recovered)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}
