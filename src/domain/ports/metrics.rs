//! Metric probe contract used by playbook verification.
//!
//! After a playbook's actions run, its verify predicate polls a named metric
//! ("cpu", "queue_depth", …) against a bound. Where those numbers come from
//! is an external concern; tests wire a scripted probe.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

/// Source of named scalar metrics.
#[async_trait]
pub trait MetricProbe: Send + Sync {
    /// Current value of the metric, or `None` when it cannot be measured.
    async fn measure(&self, metric: &str) -> Option<f64>;
}

/// Probe with no metric sources. Verification against it always fails,
/// which keeps unverifiable playbooks from reporting success.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProbe;

#[async_trait]
impl MetricProbe for NullProbe {
    async fn measure(&self, _metric: &str) -> Option<f64> {
        None
    }
}

/// In-memory probe whose values tests set directly.
#[derive(Debug, Default)]
pub struct StaticProbe {
    values: RwLock<HashMap<String, f64>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, metric: impl Into<String>, value: f64) {
        self.values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(metric.into(), value);
    }
}

#[async_trait]
impl MetricProbe for StaticProbe {
    async fn measure(&self, metric: &str) -> Option<f64> {
        self.values
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(metric)
            .copied()
    }
}
