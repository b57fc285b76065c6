//! Built-in action handlers for the reactor.
//!
//! These cover the action kinds the core can serve itself: notifying the
//! operator, enqueueing follow-up tasks, updating runtime configuration,
//! restarting (resetting) an agent, and triggering a rollback.
//! `exec.command` is deliberately not built in — running arbitrary commands
//! is an external collaborator's job, registered by the embedding process.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::models::{
    ActionDescriptor, AgentId, AgentPatch, EventSeverity, TaskPriority, TaskSpec,
};
use crate::domain::ports::{ActionContext, ActionError, ActionHandler, ActionResult, Notifier};
use crate::services::agent_registry::AgentRegistry;
use crate::services::circuit_breaker::CircuitBreakers;
use crate::services::heartbeat::Heartbeat;
use crate::services::rollback::{Rollback, SnapshotReason};
use crate::services::scheduler::Scheduler;

fn require_str<'a>(action: &'a ActionDescriptor, key: &'static str) -> Result<&'a str, ActionError> {
    action
        .params
        .get(key)
        .and_then(Value::as_str)
        .ok_or(ActionError::BadParam(key))
}

/// `notify`: forward a message to the operator notifier.
pub struct NotifyActionHandler {
    notifier: Arc<dyn Notifier>,
}

impl NotifyActionHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl ActionHandler for NotifyActionHandler {
    async fn handle(
        &self,
        action: &ActionDescriptor,
        ctx: &ActionContext,
    ) -> Result<ActionResult, ActionError> {
        let title = action
            .params
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("playbook notification");
        let body = action
            .params
            .get("body")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("triggered by {}", ctx.event.event_type));
        let severity = action
            .params
            .get("severity")
            .and_then(Value::as_str)
            .and_then(|s| match s {
                "info" => Some(EventSeverity::Info),
                "warning" => Some(EventSeverity::Warning),
                "error" => Some(EventSeverity::Error),
                "critical" => Some(EventSeverity::Critical),
                _ => None,
            })
            .unwrap_or(EventSeverity::Warning);

        self.notifier.notify(severity, title, &body, None).await;
        Ok(ActionResult::ok("notified"))
    }
}

/// `scheduler.enqueue`: submit a follow-up task described by the params.
pub struct SchedulerEnqueueHandler {
    scheduler: Arc<Scheduler>,
}

impl SchedulerEnqueueHandler {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl ActionHandler for SchedulerEnqueueHandler {
    async fn handle(
        &self,
        action: &ActionDescriptor,
        ctx: &ActionContext,
    ) -> Result<ActionResult, ActionError> {
        let task_type = require_str(action, "task_type")?;
        let description = require_str(action, "description")?;
        let mut spec = TaskSpec::new(task_type, description);
        if let Some(priority) = action
            .params
            .get("priority")
            .and_then(Value::as_str)
            .and_then(TaskPriority::from_str)
        {
            spec = spec.priority(priority);
        }
        if let Some(agent) = action.params.get("agent_id").and_then(Value::as_str) {
            spec = spec.assigned_agent(AgentId::new(agent));
        }

        let task_id = self
            .scheduler
            .submit(spec)
            .await
            .map_err(|e| ActionError::Failed(e.to_string()))?;
        Ok(ActionResult::ok(format!("enqueued {task_id}"))
            .with_side_effect(format!("task {task_id} for playbook {}", ctx.playbook_id)))
    }
}

/// `rollback.trigger`: revert an agent to its latest snapshot.
pub struct RollbackTriggerHandler {
    rollback: Arc<Rollback>,
}

impl RollbackTriggerHandler {
    pub fn new(rollback: Arc<Rollback>) -> Self {
        Self { rollback }
    }
}

#[async_trait]
impl ActionHandler for RollbackTriggerHandler {
    async fn handle(
        &self,
        action: &ActionDescriptor,
        ctx: &ActionContext,
    ) -> Result<ActionResult, ActionError> {
        let agent_id = AgentId::new(require_str(action, "agent_id")?);
        let version = self
            .rollback
            .revert_latest(&agent_id, &format!("playbook {}", ctx.playbook_id))
            .await
            .map_err(|e| ActionError::Failed(e.to_string()))?;
        Ok(ActionResult::ok(format!(
            "reverted {agent_id} to version {version}"
        )))
    }
}

/// `agent.restart`: reset the agent's breakers so traffic flows again.
/// Idempotent, resetting an already-closed breaker changes nothing.
pub struct AgentRestartHandler {
    breakers: Arc<CircuitBreakers>,
}

impl AgentRestartHandler {
    pub fn new(breakers: Arc<CircuitBreakers>) -> Self {
        Self { breakers }
    }
}

#[async_trait]
impl ActionHandler for AgentRestartHandler {
    async fn handle(
        &self,
        action: &ActionDescriptor,
        _ctx: &ActionContext,
    ) -> Result<ActionResult, ActionError> {
        let agent_id = AgentId::new(require_str(action, "agent_id")?);
        self.breakers.reset_agent(&agent_id).await;
        Ok(ActionResult::ok(format!("breakers reset for {agent_id}")))
    }
}

/// `config.update`: adjust runtime configuration. Supports the heartbeat
/// interval and patch-style agent config updates.
pub struct ConfigUpdateHandler {
    heartbeat: Arc<Heartbeat>,
    registry: Arc<AgentRegistry>,
}

impl ConfigUpdateHandler {
    pub fn new(heartbeat: Arc<Heartbeat>, registry: Arc<AgentRegistry>) -> Self {
        Self {
            heartbeat,
            registry,
        }
    }
}

#[async_trait]
impl ActionHandler for ConfigUpdateHandler {
    async fn handle(
        &self,
        action: &ActionDescriptor,
        _ctx: &ActionContext,
    ) -> Result<ActionResult, ActionError> {
        let mut effects = Vec::new();

        if let Some(interval_ms) = action
            .params
            .get("heartbeat_interval_ms")
            .and_then(Value::as_u64)
        {
            self.heartbeat
                .set_interval(std::time::Duration::from_millis(interval_ms));
            effects.push(format!("heartbeat interval set to {interval_ms}ms"));
        }

        if let Some(agent) = action.params.get("agent_id").and_then(Value::as_str) {
            let patch_value = action
                .params
                .get("patch")
                .cloned()
                .ok_or(ActionError::BadParam("patch"))?;
            let patch: AgentPatch = serde_json::from_value(patch_value)
                .map_err(|e| ActionError::Failed(format!("invalid patch: {e}")))?;
            let version = self
                .registry
                .update(&AgentId::new(agent), &patch, SnapshotReason::ConfigUpdate)
                .await
                .map_err(|e| ActionError::Failed(e.to_string()))?;
            effects.push(format!("agent {agent} updated to version {version}"));
        }

        if effects.is_empty() {
            return Err(ActionError::BadParam("heartbeat_interval_ms or agent_id"));
        }
        let mut result = ActionResult::ok("configuration updated");
        for effect in effects {
            result = result.with_side_effect(effect);
        }
        Ok(result)
    }
}
