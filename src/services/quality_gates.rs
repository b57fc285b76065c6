//! Quality gates for configuration change proposals.
//!
//! L0 validates the diff against per-field schemas, L1 replays recent traces
//! against the proposed config (or falls back to predicted-metric thresholds
//! when the worker cannot replay, escalating the risk class one level), and
//! L2 parks anything above low risk for human approval.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::domain::models::{
    AgentConfig, ChangeProposal, FieldChange, GateLevel, RiskClass, ThinkingLevel,
};
use crate::domain::ports::AgentWorker;
use crate::services::trace_recorder::TraceRecorder;

/// Gate thresholds and field schemas.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Traces replayed by L1 when the worker supports replay.
    pub replay_traces: usize,
    /// L1 fails when the (replayed or predicted) success rate drops more.
    pub max_success_drop: f64,
    /// L1 fails when the (replayed or predicted) duration grows more.
    pub max_duration_increase: f64,
    /// Acceptable timeout range for L0.
    pub timeout_range_ms: (u64, u64),
    /// Acceptable in-flight quota range for L0.
    pub max_in_flight_range: (u32, u32),
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            replay_traces: 10,
            max_success_drop: 0.10,
            max_duration_increase: 0.20,
            timeout_range_ms: (1_000, 3_600_000),
            max_in_flight_range: (1, 16),
        }
    }
}

/// Outcome of running the gates over one proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Approved,
    Rejected { gate: GateLevel, reason: String },
    /// Waiting on out-of-band human approval (L2).
    PendingHuman,
}

/// Predicted relative effect of a diff on (success rate, avg duration).
/// Conservative rule-of-thumb estimates used when replay is unavailable.
fn predicted_effect(diff: &[FieldChange]) -> (f64, f64) {
    let mut success_delta = 0.0;
    let mut duration_delta = 0.0;
    for change in diff {
        match change.field.as_str() {
            "timeout_default_ms" => {
                let from = change.from.as_f64().unwrap_or(0.0);
                let to = change.to.as_f64().unwrap_or(0.0);
                if to > from && from > 0.0 {
                    // Longer budget lets the slow tail finish.
                    success_delta += 0.05;
                    duration_delta += ((to - from) / from * 0.25).min(0.15);
                }
            }
            "thinking_level" => {
                success_delta += 0.05;
                duration_delta += 0.15;
            }
            "max_in_flight" => {
                // Less concurrency trades throughput for fewer rate limits.
                success_delta += 0.03;
                duration_delta += 0.05;
            }
            _ => {}
        }
    }
    (success_delta, duration_delta)
}

/// Runs L0/L1/L2 checks over proposals.
pub struct QualityGates {
    traces: Arc<TraceRecorder>,
    worker: Arc<dyn AgentWorker>,
    config: GateConfig,
}

impl QualityGates {
    pub fn new(traces: Arc<TraceRecorder>, worker: Arc<dyn AgentWorker>, config: GateConfig) -> Self {
        Self {
            traces,
            worker,
            config,
        }
    }

    /// Evaluate the gates in order. Mutates the proposal's risk class when
    /// L1 has to fall back to prediction.
    #[instrument(skip(self, proposal, proposed), fields(proposal = %proposal.id))]
    pub async fn evaluate(
        &self,
        proposal: &mut ChangeProposal,
        proposed: &AgentConfig,
    ) -> GateVerdict {
        if let Err(reason) = self.l0(&proposal.diff) {
            return GateVerdict::Rejected {
                gate: GateLevel::L0,
                reason,
            };
        }

        if let Err(reason) = self.l1(proposal, proposed).await {
            return GateVerdict::Rejected {
                gate: GateLevel::L1,
                reason,
            };
        }

        if proposal.risk_class >= RiskClass::Medium {
            return GateVerdict::PendingHuman;
        }
        GateVerdict::Approved
    }

    /// Syntactic / schema validation of each changed field.
    fn l0(&self, diff: &[FieldChange]) -> Result<(), String> {
        if diff.is_empty() {
            return Err("empty diff".to_string());
        }
        for change in diff {
            match change.field.as_str() {
                "timeout_default_ms" => {
                    let (lo, hi) = self.config.timeout_range_ms;
                    let value = change
                        .to
                        .as_u64()
                        .ok_or_else(|| format!("timeout_default_ms must be an integer, got {}", change.to))?;
                    if value < lo || value > hi {
                        return Err(format!(
                            "timeout_default_ms {value} outside allowed range {lo}..={hi}"
                        ));
                    }
                }
                "thinking_level" => {
                    let value = change
                        .to
                        .as_str()
                        .ok_or_else(|| "thinking_level must be a string".to_string())?;
                    serde_json::from_value::<ThinkingLevel>(serde_json::json!(value))
                        .map_err(|_| format!("unknown thinking_level {value:?}"))?;
                }
                "system_prompt" => {
                    let value = change
                        .to
                        .as_str()
                        .ok_or_else(|| "system_prompt must be a string".to_string())?;
                    if value.trim().is_empty() {
                        return Err("system_prompt must not be empty".to_string());
                    }
                }
                "max_in_flight" => {
                    let (lo, hi) = self.config.max_in_flight_range;
                    let value = change
                        .to
                        .as_u64()
                        .ok_or_else(|| "max_in_flight must be an integer".to_string())?;
                    if value < u64::from(lo) || value > u64::from(hi) {
                        return Err(format!(
                            "max_in_flight {value} outside allowed range {lo}..={hi}"
                        ));
                    }
                }
                "model_id" | "tool_permissions" | "task_types" | "capabilities"
                | "priority_class" => {}
                other => return Err(format!("field {other:?} is not gate-approvable")),
            }
        }
        Ok(())
    }

    /// Regression replay, or predicted-metric comparison when the worker
    /// cannot replay (risk class escalates one level in that case).
    async fn l1(&self, proposal: &mut ChangeProposal, proposed: &AgentConfig) -> Result<(), String> {
        if self.worker.supports_replay() {
            return self.l1_replay(proposal, proposed).await;
        }

        debug!(proposal = %proposal.id, "replay unavailable, predicting and escalating risk");
        let (success_delta, duration_delta) = predicted_effect(&proposal.diff);
        if -success_delta > self.config.max_success_drop {
            return Err(format!(
                "predicted success drop {:.2} exceeds {:.2}",
                -success_delta, self.config.max_success_drop
            ));
        }
        if duration_delta > self.config.max_duration_increase {
            return Err(format!(
                "predicted duration increase {:.2} exceeds {:.2}",
                duration_delta, self.config.max_duration_increase
            ));
        }
        proposal.risk_class = proposal.risk_class.escalated();
        Ok(())
    }

    async fn l1_replay(
        &self,
        proposal: &ChangeProposal,
        proposed: &AgentConfig,
    ) -> Result<(), String> {
        let recent = self
            .traces
            .for_agent_since(&proposal.target_agent, 0, None)
            .await;
        let sample: Vec<_> = recent
            .iter()
            .rev()
            .take(self.config.replay_traces)
            .collect();
        if sample.is_empty() {
            return Ok(()); // nothing to regress against
        }

        let proposed = Arc::new(proposed.clone());
        let mut successes = 0usize;
        let mut total_duration = 0u64;
        for trace in &sample {
            match self.worker.replay(proposed.clone(), trace).await {
                Ok(result) => {
                    if result.success {
                        successes += 1;
                    }
                    total_duration += result.duration_ms;
                }
                Err(e) => return Err(format!("replay failed: {e}")),
            }
        }

        let replayed_rate = successes as f64 / sample.len() as f64;
        let drop = proposal.metrics_before.success_rate - replayed_rate;
        if drop > self.config.max_success_drop {
            return Err(format!(
                "replayed success rate drop {:.2} exceeds {:.2}",
                drop, self.config.max_success_drop
            ));
        }

        let replayed_avg = total_duration as f64 / sample.len() as f64;
        if proposal.metrics_before.avg_duration_ms > 0.0 {
            let increase = (replayed_avg - proposal.metrics_before.avg_duration_ms)
                / proposal.metrics_before.avg_duration_ms;
            if increase > self.config.max_duration_increase {
                return Err(format!(
                    "replayed duration increase {:.2} exceeds {:.2}",
                    increase, self.config.max_duration_increase
                ));
            }
        }
        Ok(())
    }
}
