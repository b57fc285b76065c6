//! Action handler contract consumed by the reactor.
//!
//! Each playbook action type is served by a registered handler. Handlers
//! must be idempotent given the same descriptor.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::{ActionDescriptor, Event, PlaybookId};

/// Context handed to an action handler alongside the descriptor.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// The event that triggered the playbook.
    pub event: Event,
    pub playbook_id: PlaybookId,
}

/// Outcome of a single action.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub ok: bool,
    pub detail: String,
    pub side_effects: Vec<String>,
}

impl ActionResult {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
            side_effects: Vec::new(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
            side_effects: Vec::new(),
        }
    }

    pub fn with_side_effect(mut self, effect: impl Into<String>) -> Self {
        self.side_effects.push(effect.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("no handler registered for action {0}")]
    NoHandler(&'static str),

    #[error("missing or invalid parameter {0}")]
    BadParam(&'static str),

    #[error("action failed: {0}")]
    Failed(String),
}

/// A registered implementation for one action kind.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(
        &self,
        action: &ActionDescriptor,
        ctx: &ActionContext,
    ) -> Result<ActionResult, ActionError>;
}
