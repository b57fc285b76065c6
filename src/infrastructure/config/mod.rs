//! Runtime configuration.
//!
//! One `AiosConfig` document covers the whole core: environment, data
//! directory, pool sizes, and per-component tuning sections. Loaded by
//! [`loader::ConfigLoader`] with hierarchical merging and validated before
//! use.

pub mod loader;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::models::{AgentId, Env};
use crate::services::circuit_breaker::BreakerConfig;
use crate::services::dispatcher::DispatcherConfig;
use crate::services::event_bus::EventBusConfig;
use crate::services::event_store::StoreConfig;
use crate::services::heartbeat::HeartbeatConfig;
use crate::services::improvement_loop::ImprovementConfig;
use crate::services::quality_gates::GateConfig;
use crate::services::reactor::ReactorConfig;
use crate::services::rollback::RollbackConfig;
use crate::services::router::RouterConfig;
use crate::services::scheduler::SchedulerConfig;

pub use loader::{ConfigError, ConfigLoader};

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiosConfig {
    /// `prod` or `test`; test events persist to their own stream and test
    /// traces never feed the self-improvement loop.
    pub env: Env,
    /// Root directory for the event store and snapshot files.
    pub data_dir: String,
    /// Task worker pool size.
    pub workers: usize,
    /// Path to the playbook definitions file.
    pub playbooks_path: String,
    /// Fail dependents of a failed task instead of cancelling them.
    pub bubble_failure: bool,
    /// Route operator `update_agent` calls through the quality gates.
    pub gate_manual_updates: bool,
    pub heartbeat: HeartbeatSection,
    pub bus: BusSection,
    pub store: StoreSection,
    pub breaker: BreakerSection,
    pub retry: RetrySection,
    pub dispatcher: DispatcherSection,
    pub router: RouterSection,
    pub improvement: ImprovementSection,
    pub gates: GatesSection,
    pub rollback: RollbackSection,
    pub logging: LoggingSection,
}

impl Default for AiosConfig {
    fn default() -> Self {
        Self {
            env: Env::Prod,
            data_dir: ".aios/data".to_string(),
            workers: 5,
            playbooks_path: ".aios/playbooks.json".to_string(),
            bubble_failure: false,
            gate_manual_updates: false,
            heartbeat: HeartbeatSection::default(),
            bus: BusSection::default(),
            store: StoreSection::default(),
            breaker: BreakerSection::default(),
            retry: RetrySection::default(),
            dispatcher: DispatcherSection::default(),
            router: RouterSection::default(),
            improvement: ImprovementSection::default(),
            gates: GatesSection::default(),
            rollback: RollbackSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub interval_secs: u64,
    pub improvement_cadence_secs: u64,
    pub failure_window_secs: u64,
    pub breaker_notify_after_secs: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            improvement_cadence_secs: 3600,
            failure_window_secs: 600,
            breaker_notify_after_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub queue_capacity: usize,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub max_segment_bytes: u64,
    pub retention_days: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            max_segment_bytes: 8 * 1024 * 1024,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub threshold: u32,
    pub window_secs: u64,
    pub cooldown_secs: u64,
    pub cooldown_cap_secs: u64,
    pub quarantine_hours: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            threshold: 5,
            window_secs: 600,
            cooldown_secs: 60,
            cooldown_cap_secs: 3600,
            quarantine_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub runtime_retry_cap: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            cap_ms: 60_000,
            runtime_retry_cap: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub provider_rps: u32,
    pub provider_overrides: HashMap<String, u32>,
    pub cancel_grace_ms: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            provider_rps: 10,
            provider_overrides: HashMap::new(),
            cancel_grace_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub generic_agent: String,
    pub defaults: HashMap<String, String>,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            generic_agent: "coder".to_string(),
            defaults: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImprovementSection {
    pub window_hours: u64,
    pub agent_cooldown_hours: u64,
    pub target_success_rate: f64,
    pub verify_window_secs: u64,
    pub critical_multiplier: f64,
}

impl Default for ImprovementSection {
    fn default() -> Self {
        Self {
            window_hours: 24,
            agent_cooldown_hours: 6,
            target_success_rate: 0.8,
            verify_window_secs: 1800,
            critical_multiplier: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesSection {
    pub replay_traces: usize,
    pub max_success_drop: f64,
    pub max_duration_increase: f64,
}

impl Default for GatesSection {
    fn default() -> Self {
        Self {
            replay_traces: 10,
            max_success_drop: 0.10,
            max_duration_increase: 0.20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackSection {
    pub success_drop_threshold: f64,
    pub duration_increase_threshold: f64,
    pub min_traces: usize,
}

impl Default for RollbackSection {
    fn default() -> Self {
        Self {
            success_drop_threshold: 0.10,
            duration_increase_threshold: 0.20,
            min_traces: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// trace, debug, info, warn, error
    pub level: String,
    /// json or pretty
    pub format: String,
    /// Optional log file directory; stdout when absent.
    pub dir: Option<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            dir: None,
        }
    }
}

impl AiosConfig {
    pub fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::new(&self.data_dir);
        config.max_segment_bytes = self.store.max_segment_bytes;
        config.retention = Duration::from_secs(self.store.retention_days * 24 * 3600);
        config
    }

    pub fn bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            queue_capacity: self.bus.queue_capacity,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            threshold: self.breaker.threshold,
            window: Duration::from_secs(self.breaker.window_secs),
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
            cooldown_cap: Duration::from_secs(self.breaker.cooldown_cap_secs),
            quarantine_after: Duration::from_secs(self.breaker.quarantine_hours * 3600),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            retry_base: Duration::from_millis(self.retry.base_ms),
            retry_cap: Duration::from_millis(self.retry.cap_ms),
            runtime_retry_cap: self.retry.runtime_retry_cap,
            bubble_failure: self.bubble_failure,
            ..SchedulerConfig::default()
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            provider_rps: self.dispatcher.provider_rps,
            provider_overrides: self.dispatcher.provider_overrides.clone(),
            cancel_grace: Duration::from_millis(self.dispatcher.cancel_grace_ms),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            generic_agent: AgentId::new(&self.router.generic_agent),
            defaults: self
                .router
                .defaults
                .iter()
                .map(|(task_type, agent)| (task_type.clone(), AgentId::new(agent)))
                .collect(),
        }
    }

    pub fn improvement_config(&self) -> ImprovementConfig {
        ImprovementConfig {
            window: Duration::from_secs(self.improvement.window_hours * 3600),
            agent_cooldown: Duration::from_secs(self.improvement.agent_cooldown_hours * 3600),
            target_success_rate: self.improvement.target_success_rate,
            verify_window: Duration::from_secs(self.improvement.verify_window_secs),
            critical_multiplier: self.improvement.critical_multiplier,
            ..ImprovementConfig::default()
        }
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            replay_traces: self.gates.replay_traces,
            max_success_drop: self.gates.max_success_drop,
            max_duration_increase: self.gates.max_duration_increase,
            ..GateConfig::default()
        }
    }

    pub fn rollback_config(&self) -> RollbackConfig {
        RollbackConfig {
            success_drop_threshold: self.rollback.success_drop_threshold,
            duration_increase_threshold: self.rollback.duration_increase_threshold,
            min_traces: self.rollback.min_traces,
            ..RollbackConfig::default()
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat.interval_secs),
            improvement_cadence: Duration::from_secs(self.heartbeat.improvement_cadence_secs),
            failure_window: Duration::from_secs(self.heartbeat.failure_window_secs),
            breaker_notify_after: Duration::from_secs(self.heartbeat.breaker_notify_after_secs),
            ..HeartbeatConfig::default()
        }
    }

    pub fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig::default()
    }
}
