//! Per-key circuit breakers guarding agents and playbooks.
//!
//! A key transitions closed → open after `threshold` failures inside the
//! rolling window, open → half-open after the cooldown with a single probe
//! permitted, and half-open → closed on probe success or back to open on
//! probe failure with the cooldown doubling up to a cap. Keys stuck open
//! past the quarantine horizon with no successful probe require operator
//! action.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::domain::models::event::event_types;
use crate::domain::models::{AgentId, ErrorSignature, EventSeverity, PlaybookId};
use crate::domain::ports::Clock;
use crate::services::event_bus::{core_event, EventBus};

/// What a breaker protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerKey {
    AgentTask { agent: AgentId, task_type: String },
    Playbook(PlaybookId),
}

impl BreakerKey {
    pub fn agent_task(agent: AgentId, task_type: impl Into<String>) -> Self {
        Self::AgentTask {
            agent,
            task_type: task_type.into(),
        }
    }

    pub fn playbook(id: PlaybookId) -> Self {
        Self::Playbook(id)
    }
}

impl std::fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AgentTask { agent, task_type } => write!(f, "{agent}/{task_type}"),
            Self::Playbook(id) => write!(f, "playbook:{id}"),
        }
    }
}

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
    /// Open past the quarantine horizon; only an operator reset clears it.
    Quarantined,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
            Self::Quarantined => "quarantined",
        }
    }
}

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window before the breaker opens.
    pub threshold: u32,
    /// Rolling window for counting failures.
    pub window: Duration,
    /// Initial open → half-open cooldown.
    pub cooldown: Duration,
    /// Cap for the doubled cooldown after failed probes.
    pub cooldown_cap: Duration,
    /// Open this long with no probe success ⇒ quarantined.
    pub quarantine_after: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(600),
            cooldown: Duration::from_secs(60),
            cooldown_cap: Duration::from_secs(3600),
            quarantine_after: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug)]
struct BreakerCell {
    state: BreakerState,
    /// Failure timestamps (ms) within the rolling window.
    failures: Vec<i64>,
    opened_at_ms: Option<i64>,
    current_cooldown: Duration,
    probe_in_flight: bool,
    last_failure_ms: Option<i64>,
    last_signature: Option<ErrorSignature>,
}

impl BreakerCell {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: Vec::new(),
            opened_at_ms: None,
            current_cooldown: config.cooldown,
            probe_in_flight: false,
            last_failure_ms: None,
            last_signature: None,
        }
    }
}

/// Point-in-time breaker view for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub failure_count: usize,
    pub opened_at_ms: Option<i64>,
    pub last_signature: Option<String>,
}

/// Registry of per-key circuit breakers.
pub struct CircuitBreakers {
    cells: RwLock<HashMap<BreakerKey, Arc<Mutex<BreakerCell>>>>,
    config: BreakerConfig,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig, bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
            config,
            bus,
            clock,
        }
    }

    async fn cell(&self, key: &BreakerKey) -> Arc<Mutex<BreakerCell>> {
        if let Some(cell) = self.cells.read().await.get(key) {
            return cell.clone();
        }
        let mut cells = self.cells.write().await;
        cells
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerCell::new(&self.config))))
            .clone()
    }

    async fn emit_transition(&self, event_type: &str, key: &BreakerKey, extra: Option<(&str, i64)>) {
        let severity = if event_type == event_types::BREAKER_CLOSED {
            EventSeverity::Info
        } else {
            EventSeverity::Warning
        };
        let mut event =
            core_event(event_type, "circuit_breaker", severity).with_field("key", key.to_string());
        if let Some((k, v)) = extra {
            event = event.with_field(k, v);
        }
        let _ = self.bus.emit(event).await;
    }

    /// Whether a call guarded by this key may proceed right now. Transitions
    /// open → half-open (single probe) and open → quarantined as a side
    /// effect of observation.
    pub async fn should_execute(&self, key: &BreakerKey) -> bool {
        let cell = self.cell(key).await;
        let mut cell = cell.lock().await;
        let now = self.clock.now_ms();

        match cell.state {
            BreakerState::Closed => true,
            BreakerState::Quarantined => false,
            BreakerState::HalfOpen => {
                if cell.probe_in_flight {
                    false
                } else {
                    cell.probe_in_flight = true;
                    true
                }
            }
            BreakerState::Open => {
                let opened = cell.opened_at_ms.unwrap_or(now);
                if now - opened >= self.config.quarantine_after.as_millis() as i64 {
                    cell.state = BreakerState::Quarantined;
                    drop(cell);
                    warn!(%key, "breaker quarantined after prolonged open state");
                    self.emit_transition(event_types::BREAKER_QUARANTINED, key, None)
                        .await;
                    return false;
                }
                if now - opened >= cell.current_cooldown.as_millis() as i64 {
                    cell.state = BreakerState::HalfOpen;
                    cell.probe_in_flight = true;
                    drop(cell);
                    self.emit_transition(event_types::BREAKER_HALF_OPEN_PROBE, key, None)
                        .await;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful guarded call.
    pub async fn record_success(&self, key: &BreakerKey) {
        let cell = self.cell(key).await;
        let mut cell = cell.lock().await;
        match cell.state {
            BreakerState::HalfOpen => {
                cell.state = BreakerState::Closed;
                cell.failures.clear();
                cell.opened_at_ms = None;
                cell.probe_in_flight = false;
                cell.current_cooldown = self.config.cooldown;
                drop(cell);
                info!(%key, "breaker closed after successful probe");
                self.emit_transition(event_types::BREAKER_CLOSED, key, None).await;
            }
            BreakerState::Closed => {
                let cutoff = self.clock.now_ms() - self.config.window.as_millis() as i64;
                cell.failures.retain(|ts| *ts > cutoff);
            }
            BreakerState::Open | BreakerState::Quarantined => {}
        }
    }

    /// Record a failed guarded call.
    pub async fn record_failure(&self, key: &BreakerKey, signature: &ErrorSignature) {
        let cell = self.cell(key).await;
        let mut cell = cell.lock().await;
        let now = self.clock.now_ms();
        cell.last_failure_ms = Some(now);
        cell.last_signature = Some(signature.clone());

        match cell.state {
            BreakerState::Closed => {
                cell.failures.push(now);
                let cutoff = now - self.config.window.as_millis() as i64;
                cell.failures.retain(|ts| *ts > cutoff);
                if cell.failures.len() as u32 >= self.config.threshold {
                    cell.state = BreakerState::Open;
                    cell.opened_at_ms = Some(now);
                    let cooldown_ms = cell.current_cooldown.as_millis() as i64;
                    drop(cell);
                    warn!(%key, %signature, "breaker opened");
                    self.emit_transition(
                        event_types::BREAKER_OPENED,
                        key,
                        Some(("cooldown_ms", cooldown_ms)),
                    )
                    .await;
                }
            }
            BreakerState::HalfOpen => {
                // Failed probe: reopen with doubled cooldown, capped.
                cell.state = BreakerState::Open;
                cell.opened_at_ms = Some(now);
                cell.probe_in_flight = false;
                cell.current_cooldown =
                    (cell.current_cooldown * 2).min(self.config.cooldown_cap);
                let cooldown_ms = cell.current_cooldown.as_millis() as i64;
                drop(cell);
                warn!(%key, %signature, "probe failed, breaker reopened");
                self.emit_transition(
                    event_types::BREAKER_OPENED,
                    key,
                    Some(("cooldown_ms", cooldown_ms)),
                )
                .await;
            }
            BreakerState::Open | BreakerState::Quarantined => {}
        }
    }

    pub async fn state(&self, key: &BreakerKey) -> BreakerState {
        match self.cells.read().await.get(key) {
            Some(cell) => cell.lock().await.state,
            None => BreakerState::Closed,
        }
    }

    /// Timestamp a key's breaker opened at, if open.
    pub async fn opened_at(&self, key: &BreakerKey) -> Option<i64> {
        let cells = self.cells.read().await;
        let cell = cells.get(key)?;
        let cell = cell.lock().await;
        match cell.state {
            BreakerState::Open | BreakerState::Quarantined => cell.opened_at_ms,
            _ => None,
        }
    }

    /// Operator reset back to closed, clearing quarantine.
    pub async fn reset(&self, key: &BreakerKey) {
        let cell = self.cell(key).await;
        let mut cell = cell.lock().await;
        cell.state = BreakerState::Closed;
        cell.failures.clear();
        cell.opened_at_ms = None;
        cell.probe_in_flight = false;
        cell.current_cooldown = self.config.cooldown;
        drop(cell);
        self.emit_transition(event_types::BREAKER_CLOSED, key, None).await;
    }

    /// Reset every breaker key belonging to one agent.
    pub async fn reset_agent(&self, agent_id: &AgentId) {
        let keys: Vec<BreakerKey> = {
            let cells = self.cells.read().await;
            cells
                .keys()
                .filter(|k| matches!(k, BreakerKey::AgentTask { agent, .. } if agent == agent_id))
                .cloned()
                .collect()
        };
        for key in keys {
            self.reset(&key).await;
        }
    }

    /// Snapshots of every breaker not currently closed-and-idle.
    pub async fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let cells = self.cells.read().await;
        let mut out = Vec::new();
        for (key, cell) in cells.iter() {
            let cell = cell.lock().await;
            if cell.state == BreakerState::Closed && cell.failures.is_empty() {
                continue;
            }
            out.push(BreakerSnapshot {
                key: key.to_string(),
                state: cell.state,
                failure_count: cell.failures.len(),
                opened_at_ms: cell.opened_at_ms,
                last_signature: cell.last_signature.as_ref().map(ErrorSignature::wire),
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Keys currently open or quarantined.
    pub async fn open_keys(&self) -> Vec<BreakerKey> {
        let cells = self.cells.read().await;
        let mut out = Vec::new();
        for (key, cell) in cells.iter() {
            let state = cell.lock().await.state;
            if matches!(state, BreakerState::Open | BreakerState::Quarantined) {
                out.push(key.clone());
            }
        }
        out
    }

    pub async fn quarantined_keys(&self) -> Vec<BreakerKey> {
        let cells = self.cells.read().await;
        let mut out = Vec::new();
        for (key, cell) in cells.iter() {
            if cell.lock().await.state == BreakerState::Quarantined {
                out.push(key.clone());
            }
        }
        out
    }
}
