//! Agent selection for submitted tasks.
//!
//! Policy, in order: explicit assignment on the task, exact task-type match
//! in the matching env, capability-keyword match on the description with
//! ties broken by lower current load, then the configured per-type default,
//! then the generic fallback agent. Candidates whose breaker is open are
//! skipped unless every candidate is open, in which case the
//! least-recently-opened one is selected so the dispatcher can probe it once
//! its cooldown allows.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::domain::models::{AgentConfig, AgentId, ErrorSignature, Task};
use crate::services::agent_registry::AgentRegistry;
use crate::services::circuit_breaker::{BreakerKey, BreakerState, CircuitBreakers};
use crate::services::dispatcher::AgentLoadTable;

/// Router tuning: per-task-type default agents and the generic fallback.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub defaults: HashMap<String, AgentId>,
    pub generic_agent: AgentId,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            defaults: HashMap::new(),
            generic_agent: AgentId::new("coder"),
        }
    }
}

/// Routing failures, classified for the submitter.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no agent can serve the task")]
    NoAgent,

    #[error("assigned agent {0} is not registered")]
    UnknownAgent(AgentId),

    #[error("every eligible agent is quarantined")]
    Quarantined,
}

impl RouteError {
    pub fn signature(&self) -> ErrorSignature {
        match self {
            Self::NoAgent | Self::UnknownAgent(_) => ErrorSignature::UnknownAgent,
            Self::Quarantined => ErrorSignature::Quarantined,
        }
    }
}

/// A routing decision: the chosen agent and which policy picked it.
#[derive(Debug, Clone)]
pub struct Route {
    pub agent: Arc<AgentConfig>,
    pub policy: &'static str,
}

/// Classifies tasks and selects a target agent.
pub struct Router {
    registry: Arc<AgentRegistry>,
    breakers: Arc<CircuitBreakers>,
    loads: Arc<AgentLoadTable>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        registry: Arc<AgentRegistry>,
        breakers: Arc<CircuitBreakers>,
        loads: Arc<AgentLoadTable>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            loads,
            config,
        }
    }

    /// Pick an agent for the task.
    #[instrument(skip(self, task), fields(task = %task.id, task_type = %task.task_type))]
    pub async fn route(&self, task: &Task) -> Result<Route, RouteError> {
        // 1. Explicit assignment wins; breaker enforcement happens at
        //    dispatch (there is no alternative to fall back to).
        if let Some(assigned) = &task.assignment_override {
            let agent = self
                .registry
                .get(assigned)
                .await
                .ok_or_else(|| RouteError::UnknownAgent(assigned.clone()))?;
            return Ok(Route {
                agent,
                policy: "explicit",
            });
        }

        // 2. Exact match on task type and env.
        let exact: Vec<_> = self
            .registry
            .eligible_for(&task.task_type)
            .await
            .into_iter()
            .filter(|a| a.env == task.env)
            .collect();
        if !exact.is_empty() {
            return self.pick(&exact, &task.task_type, "exact").await;
        }

        // 3. Capability keywords against description tokens.
        let keyword = self.keyword_candidates(task).await;
        if !keyword.is_empty() {
            return self.pick(&keyword, &task.task_type, "keyword").await;
        }

        // 4. Designated per-type default, then the generic agent.
        let fallback_id = self
            .config
            .defaults
            .get(&task.task_type)
            .unwrap_or(&self.config.generic_agent);
        let agent = self
            .registry
            .get(fallback_id)
            .await
            .ok_or(RouteError::NoAgent)?;
        self.pick(std::slice::from_ref(&agent), &task.task_type, "fallback")
            .await
    }

    async fn keyword_candidates(&self, task: &Task) -> Vec<Arc<AgentConfig>> {
        let tokens: Vec<String> = task
            .description
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(ToString::to_string)
            .collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, Arc<AgentConfig>)> = Vec::new();
        for agent in self.registry.list().await {
            if agent.env != task.env {
                continue;
            }
            let score = agent
                .capabilities
                .iter()
                .filter(|cap| tokens.iter().any(|t| t == &cap.to_lowercase()))
                .count();
            if score > 0 {
                scored.push((score, agent));
            }
        }
        scored.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| a.id.cmp(&b.id)));
        scored.into_iter().map(|(_, a)| a).collect()
    }

    /// Apply the breaker filter and load-based tie break to a candidate set.
    /// Breakers are keyed by (agent, task type) — the task's type, the same
    /// key the dispatcher records failures under.
    async fn pick(
        &self,
        candidates: &[Arc<AgentConfig>],
        task_type: &str,
        policy: &'static str,
    ) -> Result<Route, RouteError> {
        let mut allowed: Vec<Arc<AgentConfig>> = Vec::new();
        let mut open: Vec<(i64, Arc<AgentConfig>)> = Vec::new();
        let mut quarantined = 0usize;

        for agent in candidates {
            let key = BreakerKey::agent_task(agent.id.clone(), task_type);
            match self.breakers.state(&key).await {
                BreakerState::Closed | BreakerState::HalfOpen => allowed.push(agent.clone()),
                BreakerState::Open => {
                    let opened = self.breakers.opened_at(&key).await.unwrap_or(i64::MAX);
                    open.push((opened, agent.clone()));
                }
                BreakerState::Quarantined => quarantined += 1,
            }
        }

        if let Some(agent) = self.least_loaded(allowed) {
            return Ok(Route { agent, policy });
        }

        // Every candidate's breaker is open: select the least-recently-opened
        // one; the dispatcher permits a probe once its cooldown elapses.
        if let Some((_, agent)) = open.into_iter().min_by_key(|(opened, a)| (*opened, a.id.clone()))
        {
            debug!(agent = %agent.id, "all breakers open, selecting probe candidate");
            return Ok(Route {
                agent,
                policy: "probe",
            });
        }

        if quarantined > 0 {
            Err(RouteError::Quarantined)
        } else {
            Err(RouteError::NoAgent)
        }
    }

    fn least_loaded(&self, mut candidates: Vec<Arc<AgentConfig>>) -> Option<Arc<AgentConfig>> {
        candidates.sort_by_key(|a| (self.loads.load(&a.id), a.id.clone()));
        candidates.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Env, TaskSpec};
    use crate::domain::ports::{ManualClock, SystemClock};
    use crate::services::circuit_breaker::BreakerConfig;
    use crate::services::event_bus::{EventBus, EventBusConfig};
    use crate::services::event_store::{EventStore, StoreConfig};
    use crate::services::rollback::SnapshotVault;
    use chrono::Utc;
    use std::time::Duration;

    struct Fixture {
        router: Router,
        registry: Arc<AgentRegistry>,
        breakers: Arc<CircuitBreakers>,
        loads: Arc<AgentLoadTable>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = EventStore::open(StoreConfig::new(dir.path())).unwrap();
        let store = Arc::new(store);
        let clock: Arc<dyn crate::domain::ports::Clock> = Arc::new(SystemClock);
        let bus = EventBus::new(store.clone(), clock.clone(), Env::Test, EventBusConfig::default());
        let vault = Arc::new(SnapshotVault::new(store.clone(), 8));
        let registry = Arc::new(AgentRegistry::new(vault, store, bus.clone(), clock.clone()));
        let breakers = Arc::new(CircuitBreakers::new(
            BreakerConfig {
                threshold: 2,
                ..BreakerConfig::default()
            },
            bus,
            clock,
        ));
        let loads = Arc::new(AgentLoadTable::new());
        let router = Router::new(
            registry.clone(),
            breakers.clone(),
            loads.clone(),
            RouterConfig::default(),
        );
        Fixture {
            router,
            registry,
            breakers,
            loads,
            _dir: dir,
        }
    }

    fn task(task_type: &str, description: &str) -> Task {
        Task::from_spec(TaskSpec::new(task_type, description), Utc::now())
    }

    #[tokio::test]
    async fn test_explicit_assignment_wins() {
        let f = fixture().await;
        f.registry
            .register(AgentConfig::named("coder-A", "coder").task_types(&["code"]))
            .await
            .unwrap();
        f.registry
            .register(AgentConfig::named("special", "special").task_types(&["review"]))
            .await
            .unwrap();

        let mut t = task("code", "anything");
        t.assignment_override = Some(AgentId::new("special"));
        let route = f.router.route(&t).await.unwrap();
        assert_eq!(route.agent.id.as_str(), "special");
        assert_eq!(route.policy, "explicit");
    }

    #[tokio::test]
    async fn test_exact_match_respects_env() {
        let f = fixture().await;
        f.registry
            .register(
                AgentConfig::named("coder-test", "coder")
                    .task_types(&["code"])
                    .env(Env::Test),
            )
            .await
            .unwrap();
        f.registry
            .register(AgentConfig::named("coder-prod", "coder").task_types(&["code"]))
            .await
            .unwrap();

        let route = f.router.route(&task("code", "x")).await.unwrap();
        assert_eq!(route.agent.id.as_str(), "coder-prod");

        let test_task = Task::from_spec(TaskSpec::new("code", "x").env(Env::Test), Utc::now());
        let route = f.router.route(&test_task).await.unwrap();
        assert_eq!(route.agent.id.as_str(), "coder-test");
    }

    #[tokio::test]
    async fn test_keyword_match_with_load_tie_break() {
        let f = fixture().await;
        f.registry
            .register(
                AgentConfig::named("db-expert", "specialist")
                    .task_types(&["analysis"])
                    .capabilities(&["database", "postgres"]),
            )
            .await
            .unwrap();
        f.registry
            .register(
                AgentConfig::named("db-backup", "specialist")
                    .task_types(&["analysis"])
                    .capabilities(&["database"]),
            )
            .await
            .unwrap();

        // No agent handles "research" directly; keywords decide
        let route = f
            .router
            .route(&task("research", "inspect the database indexes"))
            .await
            .unwrap();
        assert_eq!(route.policy, "keyword");
        assert_eq!(route.agent.id.as_str(), "db-backup");

        // A second keyword raises db-expert's score above the tie
        let route = f
            .router
            .route(&task("research", "inspect the postgres database indexes"))
            .await
            .unwrap();
        assert_eq!(route.agent.id.as_str(), "db-expert");
    }

    #[tokio::test]
    async fn test_fallback_to_generic() {
        let f = fixture().await;
        f.registry
            .register(AgentConfig::named("coder", "generalist").task_types(&["code"]))
            .await
            .unwrap();

        let route = f.router.route(&task("design", "zzz qqq")).await.unwrap();
        assert_eq!(route.policy, "fallback");
        assert_eq!(route.agent.id.as_str(), "coder");
    }

    #[tokio::test]
    async fn test_no_agent_at_all() {
        let f = fixture().await;
        let err = f.router.route(&task("code", "x")).await.unwrap_err();
        assert!(matches!(err, RouteError::NoAgent));
        assert_eq!(err.signature(), ErrorSignature::UnknownAgent);
    }

    #[tokio::test]
    async fn test_open_breaker_skipped_for_healthy_alternative() {
        let f = fixture().await;
        f.registry
            .register(AgentConfig::named("coder-A", "coder").task_types(&["code"]))
            .await
            .unwrap();
        f.registry
            .register(AgentConfig::named("coder-B", "coder").task_types(&["code"]))
            .await
            .unwrap();

        let key = BreakerKey::agent_task(AgentId::new("coder-A"), "code");
        for _ in 0..2 {
            f.breakers.record_failure(&key, &ErrorSignature::Timeout).await;
        }
        assert_eq!(f.breakers.state(&key).await, BreakerState::Open);

        let route = f.router.route(&task("code", "x")).await.unwrap();
        assert_eq!(route.agent.id.as_str(), "coder-B");
    }

    #[tokio::test]
    async fn test_breaker_keyed_by_task_type_for_multi_type_agent() {
        let f = fixture().await;
        f.registry
            .register(
                AgentConfig::named("multi", "generalist").task_types(&["code", "review"]),
            )
            .await
            .unwrap();
        f.registry
            .register(AgentConfig::named("reviewer-B", "reviewer").task_types(&["review"]))
            .await
            .unwrap();

        // Repeated review failures open (multi, "review") — the key the
        // dispatcher records under — while (multi, "code") stays closed.
        let review_key = BreakerKey::agent_task(AgentId::new("multi"), "review");
        for _ in 0..2 {
            f.breakers
                .record_failure(&review_key, &ErrorSignature::Timeout)
                .await;
        }
        assert_eq!(f.breakers.state(&review_key).await, BreakerState::Open);

        // A review task must skip `multi` and land on the healthy alternative
        let route = f.router.route(&task("review", "look this over")).await.unwrap();
        assert_eq!(route.agent.id.as_str(), "reviewer-B");

        // Code tasks are unaffected: that key never tripped
        let route = f.router.route(&task("code", "write it")).await.unwrap();
        assert_eq!(route.agent.id.as_str(), "multi");
    }

    #[tokio::test]
    async fn test_keyword_route_sees_breaker_opened_for_task_type() {
        let f = fixture().await;
        f.registry
            .register(
                AgentConfig::named("db-expert", "specialist")
                    .task_types(&["analysis"])
                    .capabilities(&["database"]),
            )
            .await
            .unwrap();
        f.registry
            .register(
                AgentConfig::named("db-backup", "specialist")
                    .task_types(&["analysis"])
                    .capabilities(&["database"]),
            )
            .await
            .unwrap();

        // No agent handles "research"; the dispatcher would have recorded
        // db-expert's research failures under (db-expert, "research"), not
        // under its declared "analysis" type.
        let key = BreakerKey::agent_task(AgentId::new("db-expert"), "research");
        for _ in 0..2 {
            f.breakers.record_failure(&key, &ErrorSignature::Timeout).await;
        }
        assert_eq!(f.breakers.state(&key).await, BreakerState::Open);

        let route = f
            .router
            .route(&task("research", "inspect the database indexes"))
            .await
            .unwrap();
        assert_eq!(route.policy, "keyword");
        assert_eq!(route.agent.id.as_str(), "db-backup");
    }

    #[tokio::test]
    async fn test_all_open_selects_least_recently_opened_probe() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = EventStore::open(StoreConfig::new(dir.path())).unwrap();
        let store = Arc::new(store);
        let clock = Arc::new(ManualClock::default());
        let bus = EventBus::new(store.clone(), clock.clone(), Env::Test, EventBusConfig::default());
        let vault = Arc::new(SnapshotVault::new(store.clone(), 8));
        let registry = Arc::new(AgentRegistry::new(vault, store, bus.clone(), clock.clone()));
        let breakers = Arc::new(CircuitBreakers::new(
            BreakerConfig {
                threshold: 1,
                ..BreakerConfig::default()
            },
            bus,
            clock.clone(),
        ));
        let router = Router::new(
            registry.clone(),
            breakers.clone(),
            Arc::new(AgentLoadTable::new()),
            RouterConfig::default(),
        );

        for id in ["coder-A", "coder-B"] {
            registry
                .register(AgentConfig::named(id, "coder").task_types(&["code"]))
                .await
                .unwrap();
        }

        // Open A first, then B later
        let key_a = BreakerKey::agent_task(AgentId::new("coder-A"), "code");
        let key_b = BreakerKey::agent_task(AgentId::new("coder-B"), "code");
        breakers.record_failure(&key_a, &ErrorSignature::Timeout).await;
        clock.advance(Duration::from_secs(10));
        breakers.record_failure(&key_b, &ErrorSignature::Timeout).await;

        let route = router.route(&task("code", "x")).await.unwrap();
        assert_eq!(route.policy, "probe");
        assert_eq!(route.agent.id.as_str(), "coder-A");
    }
}
