//! Event substrate properties: per-emitter ordering, at-most-once local
//! delivery, durable persistence across restart, and the heartbeat no-op
//! boundary.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use aios::domain::models::{Event, EventId, EventSeverity, EventType};
use aios::services::event_bus::{core_event, EventSubscriber};
use aios::services::Stream;
use aios::{Core, CorePorts};
use common::{test_config, Script, ScriptedWorker};

struct Collector {
    name: String,
    types: Mutex<Vec<String>>,
    ids: Mutex<Vec<EventId>>,
}

impl Collector {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            types: Mutex::new(Vec::new()),
            ids: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl EventSubscriber for Collector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &Event) -> Result<(), String> {
        self.types
            .lock()
            .await
            .push(event.event_type.as_str().to_string());
        self.ids.lock().await.push(event.id);
        Ok(())
    }
}

async fn start_core(dir: &std::path::Path) -> Arc<Core> {
    let worker = ScriptedWorker::new(Script::Succeed(Duration::from_millis(10)));
    Core::start(test_config(dir), CorePorts::new(worker))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_per_emitter_order_is_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let core = start_core(dir.path()).await;
    let collector = Collector::new("order");
    core.bus().subscribe("ping.*", collector.clone()).await.unwrap();

    let emitted: Vec<String> = (0..30).map(|i| format!("ping.seq{i}")).collect();
    for t in &emitted {
        core.bus()
            .emit(core_event(t, "test", EventSeverity::Info))
            .await
            .unwrap();
    }

    assert!(
        common::wait_for(
            || async { collector.types.lock().await.len() == emitted.len() },
            Duration::from_secs(2)
        )
        .await
    );
    let seen = collector.types.lock().await;
    assert_eq!(seen.as_slice(), emitted.as_slice());
    core.shutdown().await;
}

#[tokio::test]
async fn test_at_most_once_per_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let core = start_core(dir.path()).await;
    let collector = Collector::new("dedup");
    core.bus().subscribe("*", collector.clone()).await.unwrap();

    for i in 0..50 {
        core.bus()
            .emit(
                core_event("ping.once", "test", EventSeverity::Info).with_field("n", i),
            )
            .await
            .unwrap();
    }

    assert!(
        common::wait_for(
            || async { collector.ids.lock().await.len() >= 50 },
            Duration::from_secs(2)
        )
        .await
    );
    let ids = collector.ids.lock().await;
    let unique: HashSet<EventId> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len(), "a subscriber saw a duplicate event id");
    core.shutdown().await;
}

#[tokio::test]
async fn test_durable_events_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let core = start_core(dir.path()).await;
        core.bus()
            .emit(
                core_event("alert.disk.low", "test", EventSeverity::Warning)
                    .with_field("free_gb", 3),
            )
            .await
            .unwrap();
        core.shutdown().await;
    }

    let core = start_core(dir.path()).await;
    let events = core
        .store()
        .read::<Event>(Stream::Events, 0)
        .unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.record.event_type.as_str() == "alert.disk.low"),
        "durable event missing after restart"
    );
    core.shutdown().await;
}

#[tokio::test]
async fn test_invalid_event_type_rejected() {
    assert!(EventType::parse("Not.Valid").is_err());
    assert!(EventType::parse("").is_err());
}

#[tokio::test]
async fn test_idle_heartbeat_emits_exactly_one_health_report() {
    let dir = tempfile::tempdir().unwrap();
    let core = start_core(dir.path()).await;

    core.trigger_heartbeat().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reports = core.recent_events("core.health.report", 100);
    assert_eq!(reports.len(), 1);

    let health = core.system_health().await;
    assert_eq!(health.queue.depth(), 0);
    assert!(!health.storage_degraded);
    core.shutdown().await;
}
