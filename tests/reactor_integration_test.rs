//! Reactor remediation end-to-end: a resource alert matches a playbook,
//! the config.update action slows the heartbeat, the verify probe passes,
//! and the change is observable.

mod common;

use std::sync::Arc;
use std::time::Duration;

use aios::domain::models::{EventSeverity, PlaybookId};
use aios::domain::ports::StaticProbe;
use aios::services::event_bus::core_event;
use aios::{Core, CorePorts};
use common::{test_config, wait_for, Script, ScriptedWorker};

const PLAYBOOKS: &str = r#"[
  {
    "id": "reduce_heartbeat",
    "name": "Reduce heartbeat under CPU pressure",
    "trigger": {
      "pattern": "resource.*",
      "condition": { "op": "gt", "field": "value", "value": 90.0 }
    },
    "actions": [
      {
        "action": "config.update",
        "params": { "heartbeat_interval_ms": 120000 },
        "timeout_ms": 2000
      }
    ],
    "risk_class": "low",
    "auto_execute": true,
    "cooldown_ms": 60000,
    "verify": { "metric": "cpu", "below": 80.0, "within_ms": 2000 }
  }
]"#;

#[tokio::test]
async fn test_cpu_alert_remediation() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("playbooks.json"), PLAYBOOKS).unwrap();

    let probe = Arc::new(StaticProbe::new());
    probe.set("cpu", 60.0); // remediation "works" immediately

    let worker = ScriptedWorker::new(Script::Succeed(Duration::from_millis(10)));
    let core = Core::start(
        test_config(dir.path()),
        CorePorts::new(worker).probe(probe),
    )
    .await
    .unwrap();

    assert_eq!(core.playbooks().len().await, 1);
    let before = core.heartbeat().interval();
    assert_eq!(before, Duration::from_secs(30));

    core.bus()
        .emit(
            core_event("resource.cpu.high", "monitor", EventSeverity::Warning)
                .with_field("value", 95),
        )
        .await
        .unwrap();

    assert!(
        wait_for(
            || async { !core.recent_events("reactor.success", 10).is_empty() },
            Duration::from_secs(5)
        )
        .await,
        "reactor.success never emitted"
    );

    // The remediation is observable: heartbeat now ticks at 120s
    assert_eq!(core.heartbeat().interval(), Duration::from_secs(120));

    let id = PlaybookId::new("reduce_heartbeat");
    let successes = core
        .recent_events("reactor.success", 10)
        .iter()
        .filter(|e| e.payload.get("playbook_id").and_then(|v| v.as_str()) == Some(id.as_str()))
        .count();
    assert_eq!(successes, 1);
    core.shutdown().await;
}

#[tokio::test]
async fn test_below_threshold_alert_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("playbooks.json"), PLAYBOOKS).unwrap();

    let probe = Arc::new(StaticProbe::new());
    probe.set("cpu", 60.0);
    let worker = ScriptedWorker::new(Script::Succeed(Duration::from_millis(10)));
    let core = Core::start(
        test_config(dir.path()),
        CorePorts::new(worker).probe(probe),
    )
    .await
    .unwrap();

    core.bus()
        .emit(
            core_event("resource.cpu.high", "monitor", EventSeverity::Warning)
                .with_field("value", 42),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(core.recent_events("reactor.success", 10).is_empty());
    assert_eq!(core.heartbeat().interval(), Duration::from_secs(30));
    core.shutdown().await;
}

#[tokio::test]
async fn test_failed_verify_emits_reactor_failed() {
    let dir = tempfile::tempdir().unwrap();
    // Tight verify window so the test stays fast
    let playbooks = PLAYBOOKS.replace("\"within_ms\": 2000", "\"within_ms\": 200");
    std::fs::write(dir.path().join("playbooks.json"), playbooks).unwrap();

    let probe = Arc::new(StaticProbe::new());
    probe.set("cpu", 99.0); // remediation never takes effect

    let worker = ScriptedWorker::new(Script::Succeed(Duration::from_millis(10)));
    let core = Core::start(
        test_config(dir.path()),
        CorePorts::new(worker).probe(probe),
    )
    .await
    .unwrap();

    core.bus()
        .emit(
            core_event("resource.cpu.high", "monitor", EventSeverity::Warning)
                .with_field("value", 95),
        )
        .await
        .unwrap();

    assert!(
        wait_for(
            || async { !core.recent_events("reactor.failed", 10).is_empty() },
            Duration::from_secs(5)
        )
        .await,
        "reactor.failed never emitted"
    );
    core.shutdown().await;
}
