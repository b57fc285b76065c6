//! Circuit breaker end-to-end: repeated failures open the breaker, further
//! dispatches are rejected with `breaker_open`, and a probe is permitted
//! after the cooldown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use aios::domain::models::{AgentConfig, AgentId, TaskSpec, TaskStatus};
use aios::services::{BreakerKey, BreakerState};
use aios::{Core, CorePorts};
use common::{test_config, wait_for, Script, ScriptedWorker};

async fn wait_terminal(core: &Arc<Core>, task: aios::domain::models::TaskId) -> TaskStatus {
    wait_for(
        || async {
            core.scheduler()
                .task_status(task)
                .await
                .is_some_and(|s| s.is_terminal())
        },
        Duration::from_secs(5),
    )
    .await;
    core.scheduler().task_status(task).await.unwrap()
}

#[tokio::test]
async fn test_breaker_opens_blocks_then_probes() {
    let dir = tempfile::tempdir().unwrap();
    let worker = ScriptedWorker::new(Script::Succeed(Duration::from_millis(20)));
    // Three scripted runtime errors, then healthy again
    worker.script_for(
        "flaky",
        [
            Script::FailWith("runtime_error:ValueError", Duration::from_millis(10)),
            Script::FailWith("runtime_error:ValueError", Duration::from_millis(10)),
            Script::FailWith("runtime_error:ValueError", Duration::from_millis(10)),
        ],
    );

    let mut config = test_config(dir.path());
    config.breaker.threshold = 3;
    config.breaker.cooldown_secs = 1;
    // Runtime errors must not retry here so each task fails exactly once
    config.retry.runtime_retry_cap = 0;
    let core = Core::start(config, CorePorts::new(worker)).await.unwrap();
    core.register_agent(AgentConfig::named("coder-A", "coder").task_types(&["code"]))
        .await
        .unwrap();

    let key = BreakerKey::agent_task(AgentId::new("coder-A"), "code".to_string());

    // Three failing tasks trip the breaker
    for i in 0..3 {
        let id = core
            .submit_task(TaskSpec::new("code", format!("flaky attempt {i}")).max_retries(0))
            .await
            .unwrap();
        assert_eq!(wait_terminal(&core, id).await, TaskStatus::Failed);
    }
    assert_eq!(core.breakers().state(&key).await, BreakerState::Open);
    assert!(!core.recent_events("breaker.opened", 10).is_empty());

    // Fourth task is rejected with breaker_open (no alternative agent)
    let rejected = core
        .submit_task(TaskSpec::new("code", "while open").max_retries(0))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&core, rejected).await, TaskStatus::Failed);
    let failed = core.recent_events("task.failed", 20);
    assert!(failed.iter().any(|e| {
        e.payload.get("error_signature").and_then(|v| v.as_str()) == Some("breaker_open")
    }));

    // After the cooldown a single probe is permitted and succeeds
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let probe = core
        .submit_task(TaskSpec::new("code", "probe task").max_retries(0))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&core, probe).await, TaskStatus::Completed);
    assert_eq!(core.breakers().state(&key).await, BreakerState::Closed);
    assert!(!core.recent_events("breaker.half_open_probe", 10).is_empty());
    assert!(!core.recent_events("breaker.closed", 10).is_empty());
    core.shutdown().await;
}

#[tokio::test]
async fn test_open_breaker_reroutes_to_healthy_agent() {
    let dir = tempfile::tempdir().unwrap();
    let worker = ScriptedWorker::new(Script::Succeed(Duration::from_millis(20)));
    let core = Core::start(test_config(dir.path()), CorePorts::new(worker.clone()))
        .await
        .unwrap();
    core.register_agent(AgentConfig::named("coder-A", "coder").task_types(&["code"]))
        .await
        .unwrap();
    core.register_agent(AgentConfig::named("coder-B", "coder").task_types(&["code"]))
        .await
        .unwrap();

    // Open coder-A's breaker directly
    let key = BreakerKey::agent_task(AgentId::new("coder-A"), "code".to_string());
    for _ in 0..3 {
        core.breakers()
            .record_failure(&key, &aios::domain::models::ErrorSignature::Timeout)
            .await;
    }
    assert_eq!(core.breakers().state(&key).await, BreakerState::Open);

    // Tasks flow to coder-B
    let id = core
        .submit_task(TaskSpec::new("code", "reroute me"))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&core, id).await, TaskStatus::Completed);
    let stats_b = core.agent_stats(&AgentId::new("coder-B")).await.unwrap();
    assert_eq!(stats_b.tasks_completed, 1);
    core.shutdown().await;
}
