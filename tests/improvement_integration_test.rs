//! Self-improving loop end-to-end: recurring timeouts produce an applied
//! low-risk timeout raise, a subsequent regression window triggers automatic
//! rollback, and nothing above low risk is ever applied without approval.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use aios::domain::models::{
    AgentConfig, AgentId, Env, ErrorSignature, ProposalStatus, Trace, TraceContext, TraceId,
    TaskId,
};
use aios::domain::ports::ManualClock;
use aios::{Core, CorePorts};
use common::{test_config, Script, ScriptedWorker};

fn trace(
    agent: &AgentId,
    clock: &ManualClock,
    success: bool,
    signature: Option<ErrorSignature>,
    duration_ms: u64,
) -> Trace {
    use aios::domain::ports::Clock;
    let ended = clock.now();
    Trace {
        trace_id: TraceId::new(),
        agent_id: agent.clone(),
        task_id: TaskId::new(),
        task_type: "code".to_string(),
        started_at: ended - chrono::Duration::milliseconds(duration_ms as i64),
        ended_at: ended,
        success,
        duration_ms,
        error_signature: signature,
        env: Env::Prod,
        context: TraceContext::default(),
    }
}

struct Fixture {
    core: Arc<Core>,
    clock: Arc<ManualClock>,
    agent_id: AgentId,
    _dir: tempfile::TempDir,
}

async fn fixture(replay_success: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_at(Utc::now()));
    let worker = ScriptedWorker::with_replay(
        Script::Succeed(Duration::from_millis(10)),
        replay_success,
    );
    let mut config = test_config(dir.path());
    config.rollback.min_traces = 5;
    let core = Core::start(
        config,
        CorePorts::new(worker).clock(clock.clone()),
    )
    .await
    .unwrap();

    let agent_id = AgentId::new("coder-A");
    core.register_agent(
        AgentConfig::named("coder-A", "coder")
            .task_types(&["code"])
            .timeout_default(Duration::from_secs(30)),
    )
    .await
    .unwrap();

    Fixture {
        core,
        clock,
        agent_id,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_recurring_timeouts_produce_applied_timeout_raise() {
    let f = fixture(true).await;

    // 20 traces: half timeouts, half slow successes
    for i in 0..20 {
        let (success, sig) = if i % 2 == 0 {
            (false, Some(ErrorSignature::Timeout))
        } else {
            (true, None)
        };
        f.core
            .traces()
            .ingest(trace(&f.agent_id, &f.clock, success, sig, 25_000))
            .await
            .unwrap();
    }

    let report = f.core.improvement().run_cycle().await.unwrap();
    assert_eq!(report.proposals_created, 1);
    assert_eq!(report.applied, 1);

    // Timeout raised 30s → 45s on a new config version
    let agent = f.core.get_agent(&f.agent_id).await.unwrap();
    assert_eq!(agent.timeout_default_ms, 45_000);
    assert_eq!(agent.config_version, 2);

    let applied = f.core.list_proposals(Some(ProposalStatus::Applied)).await;
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].applied_version, Some(2));
    assert!(!f.core.recent_events("proposal.applied", 10).is_empty());
}

#[tokio::test]
async fn test_regression_after_apply_triggers_rollback() {
    let f = fixture(true).await;

    for i in 0..20 {
        let (success, sig) = if i % 2 == 0 {
            (false, Some(ErrorSignature::Timeout))
        } else {
            (true, None)
        };
        f.core
            .traces()
            .ingest(trace(&f.agent_id, &f.clock, success, sig, 25_000))
            .await
            .unwrap();
    }
    f.core.improvement().run_cycle().await.unwrap();
    assert_eq!(
        f.core.get_agent(&f.agent_id).await.unwrap().config_version,
        2
    );

    // A post-apply window where the success rate collapses
    f.clock.advance(Duration::from_secs(60));
    for _ in 0..8 {
        f.core
            .traces()
            .ingest(trace(
                &f.agent_id,
                &f.clock,
                false,
                Some(ErrorSignature::Runtime("ValueError".to_string())),
                20_000,
            ))
            .await
            .unwrap();
    }

    // Close the verification window and sweep
    f.clock.advance(Duration::from_secs(1800));
    let reverted = f.core.improvement().check_verifications().await.unwrap();
    assert_eq!(reverted, 1);

    // Agent content is back to the pre-proposal snapshot, version moved on
    let agent = f.core.get_agent(&f.agent_id).await.unwrap();
    assert_eq!(agent.timeout_default_ms, 30_000);
    assert_eq!(agent.config_version, 3);

    let proposals = f.core.list_proposals(Some(ProposalStatus::Reverted)).await;
    assert_eq!(proposals.len(), 1);
    assert!(!f.core.recent_events("rollback.executed", 10).is_empty());
}

#[tokio::test]
async fn test_rollback_is_idempotent() {
    let f = fixture(true).await;

    for _ in 0..10 {
        f.core
            .traces()
            .ingest(trace(
                &f.agent_id,
                &f.clock,
                false,
                Some(ErrorSignature::Timeout),
                25_000,
            ))
            .await
            .unwrap();
    }
    f.core.improvement().run_cycle().await.unwrap();
    let applied = f.core.list_proposals(Some(ProposalStatus::Applied)).await;
    let proposal_id = applied[0].id;

    let v_first = f.core.rollback_proposal(proposal_id).await.unwrap();
    let config_after_first = f.core.get_agent(&f.agent_id).await.unwrap();

    // Second rollback of the same proposal changes nothing
    let v_second = f.core.rollback_proposal(proposal_id).await.unwrap();
    let config_after_second = f.core.get_agent(&f.agent_id).await.unwrap();
    assert_eq!(v_first, v_second);
    assert!(config_after_first.same_content(&config_after_second));
    assert_eq!(
        config_after_first.config_version,
        config_after_second.config_version
    );
}

#[tokio::test]
async fn test_low_success_rate_proposal_waits_for_human() {
    let f = fixture(true).await;

    // Failures that are not timeouts or rate limits: the only applicable
    // finding is the low success rate, which maps to a thinking-level raise
    // above low risk.
    for i in 0..10 {
        let success = i < 3;
        let sig = (!success).then(|| ErrorSignature::Runtime("KeyError".to_string()));
        f.core
            .traces()
            .ingest(trace(&f.agent_id, &f.clock, success, sig, 10_000))
            .await
            .unwrap();
    }

    let report = f.core.improvement().run_cycle().await.unwrap();
    assert_eq!(report.proposals_created, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(report.gated, 1);

    // Safety: nothing above low risk applied without approval
    let agent = f.core.get_agent(&f.agent_id).await.unwrap();
    assert_eq!(agent.config_version, 1);

    // Operator approves out of band; the change applies
    let gated = f.core.list_proposals(Some(ProposalStatus::Gated)).await;
    assert_eq!(gated.len(), 1);
    f.core.approve_proposal(gated[0].id).await.unwrap();

    let agent = f.core.get_agent(&f.agent_id).await.unwrap();
    assert_eq!(agent.config_version, 2);
    assert_eq!(
        agent.thinking_level,
        aios::domain::models::ThinkingLevel::Medium
    );
}

#[tokio::test]
async fn test_agent_cooldown_prevents_thrash() {
    let f = fixture(true).await;

    for _ in 0..10 {
        f.core
            .traces()
            .ingest(trace(
                &f.agent_id,
                &f.clock,
                false,
                Some(ErrorSignature::Timeout),
                25_000,
            ))
            .await
            .unwrap();
    }
    let first = f.core.improvement().run_cycle().await.unwrap();
    assert_eq!(first.proposals_created, 1);

    // Timeouts persist, but the per-agent cooldown suppresses a second
    // proposal inside the window
    let second = f.core.improvement().run_cycle().await.unwrap();
    assert_eq!(second.proposals_created, 0);

    f.clock.advance(Duration::from_secs(7 * 3600));
    let third = f.core.improvement().run_cycle().await.unwrap();
    // Past the cooldown the loop may analyze this agent again
    assert!(third.agents_analyzed >= 1);
}
