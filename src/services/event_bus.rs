//! In-process event bus with wildcard subscriptions.
//!
//! `emit` validates the event, stamps its timestamp, persists it through the
//! event store, then fans out to subscribers. Each subscription owns a
//! bounded queue drained by its own task: one slow subscriber never blocks
//! the others, and per-emitter FIFO order is preserved per subscriber.
//!
//! Backpressure: when a subscriber's queue is full, events below `Warning`
//! severity are dropped and counted; warnings and errors are never dropped.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::models::event::event_types;
use crate::domain::models::{Env, Event, EventId, EventPattern, EventSeverity, EventType, EventTypeError};
use crate::domain::ports::Clock;
use crate::services::event_store::{EventStore, RepairReport, Stream, StoreError};

/// Maximum nesting depth accepted in event payloads.
const MAX_PAYLOAD_DEPTH: usize = 32;

/// Identifier for a live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    InvalidType(#[from] EventTypeError),

    #[error("payload nesting exceeds depth {MAX_PAYLOAD_DEPTH}")]
    PayloadTooDeep,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handler invoked for every event matching a subscription's pattern.
///
/// Errors are caught, logged, and re-emitted as `core.subscriber.error`
/// events; they never propagate to the emitter.
#[async_trait::async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &Event) -> Result<(), String>;
}

struct Subscription {
    id: SubscriptionId,
    name: String,
    pattern: EventPattern,
    tx: mpsc::Sender<Arc<Event>>,
}

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Per-subscription queue capacity (the backpressure high-water mark).
    pub queue_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// Single in-process bus; persists every emitted event via the store.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    drainers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    store: Arc<EventStore>,
    clock: Arc<dyn Clock>,
    env: Env,
    config: EventBusConfig,
    /// Enforces non-decreasing stamped timestamps.
    last_ts: AtomicI64,
    /// Set after the store reports exhaustion; cleared by `restore_storage`.
    degraded: AtomicBool,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(
        store: Arc<EventStore>,
        clock: Arc<dyn Clock>,
        env: Env,
        config: EventBusConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(Vec::new()),
            drainers: Mutex::new(Vec::new()),
            store,
            clock,
            env,
            config,
            last_ts: AtomicI64::new(0),
            degraded: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        })
    }

    /// Announce store repairs performed at startup as events.
    pub async fn announce_repairs(self: &Arc<Self>, repairs: &[RepairReport]) {
        for repair in repairs {
            let event = Event::new(
                EventType::parse(event_types::CORE_STORAGE_REPAIRED).expect("static event type"),
                "event_store",
                EventSeverity::Warning,
            )
            .with_field("stream", repair.stream.as_str())
            .with_field("dropped_bytes", repair.dropped_bytes);
            let _ = self.emit(event).await;
        }
    }

    fn persist_stream(&self) -> Stream {
        match self.env {
            Env::Prod => Stream::Events,
            Env::Test => Stream::TestEvents,
        }
    }

    /// Emit an event: validate, stamp, persist, fan out.
    pub async fn emit(self: &Arc<Self>, mut event: Event) -> Result<EventId, BusError> {
        if event.payload_depth() > MAX_PAYLOAD_DEPTH {
            return Err(BusError::PayloadTooDeep);
        }

        // Stamp a non-decreasing timestamp.
        let now = self.clock.now_ms();
        let stamped = self.last_ts.fetch_max(now, Ordering::SeqCst).max(now);
        event.timestamp_ms = stamped;

        if !self.degraded.load(Ordering::SeqCst) {
            match self.store.append(self.persist_stream(), &event, event.durable).await {
                Ok(_) => {}
                Err(StoreError::StorageExhausted) => {
                    self.degraded.store(true, Ordering::SeqCst);
                    error!("event store exhausted; degrading to in-memory delivery");
                    let degraded_event = Event::new(
                        EventType::parse(event_types::CORE_STORAGE_DEGRADED)
                            .expect("static event type"),
                        "event_bus",
                        EventSeverity::Error,
                    )
                    .durable(false);
                    self.fan_out(Arc::new(degraded_event)).await;
                }
                Err(e) => {
                    // Persistence trouble short of disk-full is logged but
                    // does not block delivery.
                    warn!(error = %e, "failed to persist event");
                    if event.durable {
                        return Err(e.into());
                    }
                }
            }
        }

        let id = event.id;
        self.fan_out(Arc::new(event)).await;
        Ok(id)
    }

    async fn fan_out(&self, event: Arc<Event>) {
        let subs = self.subscriptions.read().await;
        for sub in subs.iter() {
            if !sub.pattern.matches(&event.event_type) {
                continue;
            }
            if event.severity >= EventSeverity::Warning {
                // Warnings and errors are never dropped; emit applies
                // backpressure instead.
                if sub.tx.send(event.clone()).await.is_err() {
                    debug!(subscriber = %sub.name, "subscription closed, skipping");
                }
            } else if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(event.clone())
            {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Register a handler for all events whose type matches `pattern`.
    pub async fn subscribe(
        self: &Arc<Self>,
        pattern: &str,
        handler: Arc<dyn EventSubscriber>,
    ) -> Result<SubscriptionId, BusError> {
        let pattern = EventPattern::parse(pattern)?;
        let (tx, mut rx) = mpsc::channel::<Arc<Event>>(self.config.queue_capacity);
        let id = SubscriptionId::new();
        let name = handler.name().to_string();

        let bus = Arc::downgrade(self);
        let drainer_name = name.clone();
        let drainer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let outcome = std::panic::AssertUnwindSafe(handler.on_event(&event))
                    .catch_unwind()
                    .await;
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some("handler panicked".to_string()),
                };
                if let Some(reason) = failure {
                    warn!(subscriber = %drainer_name, error = %reason, "subscriber failed");
                    // Never recurse on failures handling the error event
                    // itself.
                    if event.event_type.as_str() == event_types::CORE_SUBSCRIBER_ERROR {
                        continue;
                    }
                    if let Some(bus) = bus.upgrade() {
                        let report = Event::new(
                            EventType::parse(event_types::CORE_SUBSCRIBER_ERROR)
                                .expect("static event type"),
                            "event_bus",
                            EventSeverity::Warning,
                        )
                        .with_field("subscriber", drainer_name.clone())
                        .with_field("event_type", event.event_type.as_str())
                        .with_field("error", reason);
                        let _ = bus.emit(report).await;
                    }
                }
            }
        });

        self.drainers.lock().await.push(drainer);
        self.subscriptions.write().await.push(Subscription {
            id,
            name,
            pattern,
            tx,
        });
        Ok(id)
    }

    /// Remove a subscription; its drainer exits once the queue empties.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.write().await.retain(|s| s.id != id);
    }

    /// Events dropped under backpressure since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Attempt to leave degraded mode by probing the store.
    pub fn restore_storage(&self) -> bool {
        if !self.is_degraded() {
            return true;
        }
        if self.store.probe().is_ok() {
            self.degraded.store(false, Ordering::SeqCst);
            return true;
        }
        false
    }

    pub fn store(&self) -> Arc<EventStore> {
        self.store.clone()
    }

    /// Drop all subscriptions and wait for their drainers to finish.
    pub async fn shutdown(&self) {
        self.subscriptions.write().await.clear();
        let mut drainers = self.drainers.lock().await;
        for handle in drainers.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Convenience constructor for core-emitted events; panics only on
/// programmer-error type strings, which the constants in
/// [`event_types`] rule out.
pub fn core_event(event_type: &str, source: &str, severity: EventSeverity) -> Event {
    let parsed = EventType::parse(event_type)
        .unwrap_or_else(|_| EventType::parse("core.invalid").expect("static event type"));
    Event::new(parsed, source, severity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::SystemClock;
    use crate::services::event_store::StoreConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Recorder {
        name: String,
        seen: Mutex<Vec<String>>,
        count: AtomicUsize,
        delay: Option<Duration>,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
                delay: None,
                fail: false,
            })
        }
    }

    #[async_trait::async_trait]
    impl EventSubscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_event(&self, event: &Event) -> Result<(), String> {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.seen.lock().await.push(event.event_type.as_str().to_string());
            self.count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn new_bus() -> (Arc<EventBus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = EventStore::open(StoreConfig::new(dir.path())).unwrap();
        let bus = EventBus::new(
            Arc::new(store),
            Arc::new(SystemClock),
            Env::Prod,
            EventBusConfig::default(),
        );
        (bus, dir)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_wildcard_delivery() {
        let (bus, _dir) = new_bus();
        let sub = Recorder::new("agent-watcher");
        bus.subscribe("agent.*", sub.clone()).await.unwrap();

        bus.emit(core_event("agent.task.started", "test", EventSeverity::Info))
            .await
            .unwrap();
        bus.emit(core_event("task.submitted", "test", EventSeverity::Info))
            .await
            .unwrap();
        settle().await;

        let seen = sub.seen.lock().await;
        assert_eq!(seen.as_slice(), ["agent.task.started"]);
    }

    #[tokio::test]
    async fn test_per_emitter_fifo_order() {
        let (bus, _dir) = new_bus();
        let sub = Recorder::new("ordered");
        bus.subscribe("*", sub.clone()).await.unwrap();

        for i in 0..20 {
            let t = if i % 2 == 0 { "task.submitted" } else { "task.queued" };
            bus.emit(core_event(t, "emitter", EventSeverity::Info))
                .await
                .unwrap();
        }
        settle().await;

        let seen = sub.seen.lock().await;
        assert_eq!(seen.len(), 20);
        for (i, t) in seen.iter().enumerate() {
            let expected = if i % 2 == 0 { "task.submitted" } else { "task.queued" };
            assert_eq!(t, expected);
        }
    }

    #[tokio::test]
    async fn test_subscriber_error_reported_not_propagated() {
        let (bus, _dir) = new_bus();
        let mut failing = Recorder {
            name: "failing".to_string(),
            seen: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
            delay: None,
            fail: true,
        };
        failing.fail = true;
        let failing = Arc::new(failing);
        let watcher = Recorder::new("error-watcher");

        bus.subscribe("task.*", failing).await.unwrap();
        bus.subscribe("core.subscriber.error", watcher.clone()).await.unwrap();

        // Emit succeeds even though the handler fails
        bus.emit(core_event("task.submitted", "test", EventSeverity::Info))
            .await
            .unwrap();
        settle().await;

        assert_eq!(watcher.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_low_severity_dropped_under_backpressure() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = EventStore::open(StoreConfig::new(dir.path())).unwrap();
        let bus = EventBus::new(
            Arc::new(store),
            Arc::new(SystemClock),
            Env::Prod,
            EventBusConfig { queue_capacity: 2 },
        );

        let slow = Arc::new(Recorder {
            name: "slow".to_string(),
            seen: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
            delay: Some(Duration::from_millis(200)),
            fail: false,
        });
        bus.subscribe("*", slow).await.unwrap();

        for _ in 0..10 {
            bus.emit(core_event("telemetry.sample", "test", EventSeverity::Debug))
                .await
                .unwrap();
        }
        assert!(bus.dropped_count() > 0);
    }

    #[tokio::test]
    async fn test_timestamps_non_decreasing() {
        let (bus, _dir) = new_bus();
        let sub = Recorder::new("ts");
        bus.subscribe("*", sub).await.unwrap();

        let mut last = 0i64;
        for _ in 0..5 {
            bus.emit(core_event("task.queued", "test", EventSeverity::Info))
                .await
                .unwrap();
        }
        let events = bus.store().read::<Event>(Stream::Events, 0).unwrap();
        for e in events {
            assert!(e.record.timestamp_ms >= last);
            last = e.record.timestamp_ms;
        }
    }

    #[tokio::test]
    async fn test_durable_events_persisted() {
        let (bus, _dir) = new_bus();
        bus.emit(core_event("breaker.opened", "breaker", EventSeverity::Warning))
            .await
            .unwrap();

        let events = bus.store().read::<Event>(Stream::Events, 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].record.event_type.as_str(), "breaker.opened");
    }
}
