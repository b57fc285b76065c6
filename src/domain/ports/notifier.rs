//! Operator notification contract.
//!
//! The shipper itself (Telegram, Slack, …) lives outside the core; failures
//! are swallowed and logged so notification problems never break control
//! flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::models::EventSeverity;
use crate::domain::ports::clock::Clock;

/// Outbound operator notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        severity: EventSeverity,
        title: &str,
        body: &str,
        correlation_id: Option<Uuid>,
    );
}

/// Notifier that drops everything. Default when no shipper is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(
        &self,
        severity: EventSeverity,
        title: &str,
        _body: &str,
        _correlation_id: Option<Uuid>,
    ) {
        tracing::debug!(%severity, title, "notification dropped (no notifier configured)");
    }
}

/// Wrapper that coalesces repeated identical notifications within a cooldown
/// window, keyed by title.
pub struct ThrottledNotifier {
    inner: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    cooldown_ms: i64,
    last_sent: Mutex<HashMap<String, i64>>,
}

impl ThrottledNotifier {
    pub fn new(inner: Arc<dyn Notifier>, clock: Arc<dyn Clock>, cooldown: Duration) -> Self {
        Self {
            inner,
            clock,
            cooldown_ms: cooldown.as_millis() as i64,
            last_sent: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Notifier for ThrottledNotifier {
    async fn notify(
        &self,
        severity: EventSeverity,
        title: &str,
        body: &str,
        correlation_id: Option<Uuid>,
    ) {
        let now = self.clock.now_ms();
        {
            let mut last = self.last_sent.lock().await;
            if let Some(sent) = last.get(title) {
                if now - sent < self.cooldown_ms {
                    tracing::debug!(title, "notification coalesced within cooldown");
                    return;
                }
            }
            last.insert(title.to_string(), now);
        }
        self.inner.notify(severity, title, body, correlation_id).await;
    }
}
