//! AIOS — autonomic operations runtime for a fleet of LLM-backed agents.
//!
//! The core is the control plane that turns raw observations into routed
//! work, automatic remediation, and gated self-improvement:
//! - Ordered, persistent event bus over an append-log store
//! - Priority scheduler with bounded concurrency, retries, and DAG plans
//! - Router and dispatcher with circuit breakers and quotas
//! - Reactor matching events against remediation playbooks
//! - Self-improving loop proposing gated config changes with rollback
//! - Heartbeat driver reporting system health
//!
//! The LLM call layer, notification shippers, and dashboards are external
//! collaborators behind the traits in [`domain::ports`].

pub mod core;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use crate::core::{Core, CoreError, CorePorts};
pub use crate::infrastructure::config::{AiosConfig, ConfigLoader};
