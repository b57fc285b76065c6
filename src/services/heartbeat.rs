//! Periodic driver tick.
//!
//! Every tick pumps the scheduler, runs due maintenance jobs, drives the
//! self-improving loop on its cadence, and emits exactly one
//! `core.health.report` built from queue depth, breaker states, recent
//! failure rate, and store disk usage. The interval is adjustable at
//! runtime so remediation playbooks can slow the system down under load.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::models::event::event_types;
use crate::domain::models::{EventSeverity, HealthReport};
use crate::domain::ports::{Clock, Notifier};
use crate::services::circuit_breaker::{BreakerState, CircuitBreakers};
use crate::services::event_bus::{core_event, EventBus};
use crate::services::event_store::{EventStore, Stream};
use crate::services::improvement_loop::SelfImprovingLoop;
use crate::services::scheduler::Scheduler;
use crate::services::trace_recorder::TraceRecorder;

/// Heartbeat tuning knobs.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// How often the self-improving loop runs a full cycle.
    pub improvement_cadence: Duration,
    /// Trace window behind the health report's failure rate.
    pub failure_window: Duration,
    /// Operator is notified about breakers open longer than this.
    pub breaker_notify_after: Duration,
    /// Gap between store retention prunes.
    pub prune_cadence: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            improvement_cadence: Duration::from_secs(3600),
            failure_window: Duration::from_secs(600),
            breaker_notify_after: Duration::from_secs(900),
            prune_cadence: Duration::from_secs(24 * 3600),
        }
    }
}

/// The tick that keeps everything moving.
pub struct Heartbeat {
    scheduler: Arc<Scheduler>,
    improvement: Arc<SelfImprovingLoop>,
    breakers: Arc<CircuitBreakers>,
    traces: Arc<TraceRecorder>,
    store: Arc<EventStore>,
    bus: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: HeartbeatConfig,
    interval_ms: AtomicU64,
    last_improvement_ms: Mutex<Option<i64>>,
    last_prune_ms: Mutex<Option<i64>>,
    running: AtomicBool,
}

impl Heartbeat {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Arc<Scheduler>,
        improvement: Arc<SelfImprovingLoop>,
        breakers: Arc<CircuitBreakers>,
        traces: Arc<TraceRecorder>,
        store: Arc<EventStore>,
        bus: Arc<EventBus>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: HeartbeatConfig,
    ) -> Arc<Self> {
        let interval_ms = config.interval.as_millis() as u64;
        Arc::new(Self {
            scheduler,
            improvement,
            breakers,
            traces,
            store,
            bus,
            notifier,
            clock,
            config,
            interval_ms: AtomicU64::new(interval_ms.max(1)),
            last_improvement_ms: Mutex::new(None),
            last_prune_ms: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    /// Adjust the tick interval; picked up before the next tick.
    pub fn set_interval(&self, interval: Duration) {
        let ms = (interval.as_millis() as u64).max(1);
        self.interval_ms.store(ms, Ordering::SeqCst);
        info!(interval_ms = ms, "heartbeat interval updated");
    }

    /// Spawn the periodic loop. Returns the driver handle; `stop` ends it.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let heartbeat = self.clone();
        tokio::spawn(async move {
            while heartbeat.running.load(Ordering::SeqCst) {
                tokio::time::sleep(heartbeat.interval()).await;
                if !heartbeat.running.load(Ordering::SeqCst) {
                    break;
                }
                heartbeat.tick().await;
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One tick. Also the `trigger_heartbeat()` control-surface entry.
    pub async fn tick(&self) {
        let now_ms = self.clock.now_ms();

        self.scheduler.pump();

        self.run_due_jobs(now_ms).await;

        if self.improvement_due(now_ms).await {
            match self.improvement.run_cycle().await {
                Ok(report) => debug!(
                    analyzed = report.agents_analyzed,
                    proposals = report.proposals_created,
                    applied = report.applied,
                    "improvement cycle finished"
                ),
                Err(e) => warn!(error = %e, "improvement cycle failed"),
            }
        } else if let Err(e) = self.improvement.check_verifications().await {
            warn!(error = %e, "verification sweep failed");
        }

        if self.bus.is_degraded() && self.bus.restore_storage() {
            info!("event store writable again, leaving degraded mode");
        }

        let report = self.health_report().await;
        self.notify_unhealthy(&report, now_ms).await;

        let event = core_event(
            event_types::CORE_HEALTH_REPORT,
            "heartbeat",
            EventSeverity::Info,
        )
        .with_field("queue_depth", report.queue.depth())
        .with_field("running", report.queue.running)
        .with_field("open_breakers", serde_json::json!(report.open_breakers))
        .with_field("quarantined", serde_json::json!(report.quarantined_breakers))
        .with_field("recent_failure_rate", report.recent_failure_rate)
        .with_field("store_bytes", report.store_bytes)
        .with_field("storage_degraded", report.storage_degraded);
        let _ = self.bus.emit(event).await;
    }

    async fn improvement_due(&self, now_ms: i64) -> bool {
        let mut last = self.last_improvement_ms.lock().await;
        let cadence = self.config.improvement_cadence.as_millis() as i64;
        let due = last.is_none_or(|ts| now_ms - ts >= cadence);
        if due {
            *last = Some(now_ms);
        }
        due
    }

    async fn run_due_jobs(&self, now_ms: i64) {
        let mut last = self.last_prune_ms.lock().await;
        let cadence = self.config.prune_cadence.as_millis() as i64;
        if last.is_some_and(|ts| now_ms - ts < cadence) {
            return;
        }
        *last = Some(now_ms);
        drop(last);

        for stream in Stream::ALL {
            match self.store.prune(stream, SystemTime::now()).await {
                Ok(0) => {}
                Ok(removed) => debug!(%stream, removed, "pruned rotated segments"),
                Err(e) => warn!(%stream, error = %e, "prune failed"),
            }
        }
    }

    /// Build the current health projection. Shared with `system_health()`.
    pub async fn health_report(&self) -> HealthReport {
        let queue = self.scheduler.queue_status().await;
        let snapshots = self.breakers.snapshots().await;
        let open_breakers: Vec<String> = snapshots
            .iter()
            .filter(|s| s.state == BreakerState::Open)
            .map(|s| s.key.clone())
            .collect();
        let quarantined_breakers: Vec<String> = snapshots
            .iter()
            .filter(|s| s.state == BreakerState::Quarantined)
            .map(|s| s.key.clone())
            .collect();

        HealthReport {
            generated_at: self.clock.now(),
            queue,
            open_breakers,
            quarantined_breakers,
            recent_failure_rate: self
                .traces
                .recent_failure_rate(self.config.failure_window.as_millis() as i64)
                .await,
            store_bytes: self.store.disk_usage(),
            storage_degraded: self.bus.is_degraded(),
            events_dropped: self.bus.dropped_count(),
        }
    }

    async fn notify_unhealthy(&self, report: &HealthReport, now_ms: i64) {
        if report.storage_degraded {
            self.notifier
                .notify(
                    EventSeverity::Error,
                    "event store degraded",
                    "appends are failing; events are delivered in-memory only",
                    None,
                )
                .await;
        }
        for key in &report.quarantined_breakers {
            self.notifier
                .notify(
                    EventSeverity::Critical,
                    &format!("breaker quarantined: {key}"),
                    "open past the quarantine horizon; operator reset required",
                    None,
                )
                .await;
        }
        let notify_after = self.config.breaker_notify_after.as_millis() as i64;
        let open_keys = self.breakers.open_keys().await;
        for key in open_keys {
            if let Some(opened) = self.breakers.opened_at(&key).await {
                if now_ms - opened > notify_after {
                    self.notifier
                        .notify(
                            EventSeverity::Warning,
                            &format!("breaker open: {key}"),
                            &format!("open for {}s without recovery", (now_ms - opened) / 1000),
                            None,
                        )
                        .await;
                }
            }
        }
    }
}
