//! Authoritative store of live agent configuration.
//!
//! Reads are copy-on-write: callers get an `Arc<AgentConfig>` snapshot that
//! stays valid while updates swap the map entry behind them. Mutations are
//! serialized per agent, deposit a snapshot with the vault before the new
//! record goes live, strictly bump `config_version`, and emit
//! `agent.config.updated`. Stats updates are a separate atomic fast path
//! that never bumps the version.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument};

use crate::domain::models::event::event_types;
use crate::domain::models::{
    AgentConfig, AgentId, AgentPatch, AgentStatsSnapshot, EventSeverity, FieldChange,
};
use crate::domain::ports::Clock;
use crate::services::event_bus::{core_event, EventBus};
use crate::services::event_store::{EventStore, Stream, StoreError};
use crate::services::rollback::{SnapshotReason, SnapshotVault};

/// Error type for registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("agent {0} already registered")]
    AlreadyRegistered(AgentId),

    #[error("empty patch for agent {0}")]
    EmptyPatch(AgentId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lock-free execution counters for one agent.
#[derive(Debug, Default)]
pub struct AgentStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    last_failure_ms: AtomicI64,
}

impl AgentStats {
    pub fn record_success(&self, duration_ms: u64) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self, duration_ms: u64, at_ms: i64) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.last_failure_ms.store(at_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AgentStatsSnapshot {
        let completed = self.tasks_completed.load(Ordering::Relaxed);
        let failed = self.tasks_failed.load(Ordering::Relaxed);
        let total = completed + failed;
        let total_duration = self.total_duration_ms.load(Ordering::Relaxed);
        let last_failure = self.last_failure_ms.load(Ordering::Relaxed);
        AgentStatsSnapshot {
            tasks_completed: completed,
            tasks_failed: failed,
            success_rate: if total > 0 {
                completed as f64 / total as f64
            } else {
                0.0
            },
            avg_duration_ms: if total > 0 {
                total_duration as f64 / total as f64
            } else {
                0.0
            },
            last_failure_ms: (last_failure > 0).then_some(last_failure),
        }
    }
}

/// History record appended on every configuration change.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ConfigHistoryRecord {
    config: AgentConfig,
    changed_at_ms: i64,
    restored: bool,
}

/// Live agent configuration and stats.
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, Arc<AgentConfig>>>,
    stats: RwLock<HashMap<AgentId, Arc<AgentStats>>>,
    /// Serializes mutations per agent.
    update_locks: Mutex<HashMap<AgentId, Arc<Mutex<()>>>>,
    vault: Arc<SnapshotVault>,
    store: Arc<EventStore>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl AgentRegistry {
    pub fn new(
        vault: Arc<SnapshotVault>,
        store: Arc<EventStore>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            stats: RwLock::new(HashMap::new()),
            update_locks: Mutex::new(HashMap::new()),
            vault,
            store,
            bus,
            clock,
        }
    }

    /// Load the current agent set from the snapshot file, if present.
    pub async fn recover(&self) -> Result<usize, RegistryError> {
        let Some(configs) = self.store.read_snapshot::<Vec<AgentConfig>>("agent_configs")? else {
            return Ok(0);
        };
        let count = configs.len();
        let mut agents = self.agents.write().await;
        let mut stats = self.stats.write().await;
        for config in configs {
            stats
                .entry(config.id.clone())
                .or_insert_with(|| Arc::new(AgentStats::default()));
            agents.insert(config.id.clone(), Arc::new(config));
        }
        Ok(count)
    }

    async fn update_lock(&self, id: &AgentId) -> Arc<Mutex<()>> {
        let mut locks = self.update_locks.lock().await;
        locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn persist_current(&self) -> Result<(), StoreError> {
        let agents = self.agents.read().await;
        let mut configs: Vec<&AgentConfig> = agents.values().map(Arc::as_ref).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        self.store.write_snapshot("agent_configs", &configs)
    }

    /// Register a new agent. Fails if the id is taken.
    #[instrument(skip(self, config), fields(agent = %config.id))]
    pub async fn register(&self, config: AgentConfig) -> Result<(), RegistryError> {
        {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&config.id) {
                return Err(RegistryError::AlreadyRegistered(config.id.clone()));
            }
            agents.insert(config.id.clone(), Arc::new(config.clone()));
        }
        self.stats
            .write()
            .await
            .entry(config.id.clone())
            .or_insert_with(|| Arc::new(AgentStats::default()));

        let record = ConfigHistoryRecord {
            config: config.clone(),
            changed_at_ms: self.clock.now_ms(),
            restored: false,
        };
        self.store.append(Stream::AgentConfigs, &record, true).await?;
        self.persist_current().await?;
        info!(agent = %config.id, "agent registered");
        Ok(())
    }

    pub async fn get(&self, id: &AgentId) -> Option<Arc<AgentConfig>> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<AgentConfig>> {
        let mut out: Vec<_> = self.agents.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Apply a partial update: snapshot → bump version → swap → persist →
    /// emit. Returns the new config version.
    #[instrument(skip(self, patch), fields(agent = %id))]
    pub async fn update(
        &self,
        id: &AgentId,
        patch: &AgentPatch,
        reason: SnapshotReason,
    ) -> Result<u64, RegistryError> {
        if patch.is_empty() {
            return Err(RegistryError::EmptyPatch(id.clone()));
        }
        let lock = self.update_lock(id).await;
        let _guard = lock.lock().await;

        let current = self
            .get(id)
            .await
            .ok_or_else(|| RegistryError::UnknownAgent(id.clone()))?;

        self.vault
            .deposit(&current, reason, self.clock.now())
            .await?;

        let mut next = patch.apply_to(&current);
        next.config_version = current.config_version + 1;
        let diff = diff_configs(&current, &next);
        let new_version = next.config_version;

        self.commit(next, false).await?;
        info!(agent = %id, version = new_version, changed = diff.len(), "agent config updated");
        Ok(new_version)
    }

    /// Restore a full prior configuration (rollback path). Bumps the version
    /// — versions strictly increase even when content goes backward — and
    /// does not deposit a new snapshot, so repeating a revert converges.
    pub async fn restore(&self, snapshot: &AgentConfig) -> Result<u64, RegistryError> {
        let lock = self.update_lock(&snapshot.id).await;
        let _guard = lock.lock().await;

        let current = self
            .get(&snapshot.id)
            .await
            .ok_or_else(|| RegistryError::UnknownAgent(snapshot.id.clone()))?;

        let mut next = snapshot.clone();
        next.config_version = current.config_version + 1;
        let new_version = next.config_version;
        self.commit(next, true).await?;
        Ok(new_version)
    }

    async fn commit(&self, next: AgentConfig, restored: bool) -> Result<(), RegistryError> {
        let record = ConfigHistoryRecord {
            config: next.clone(),
            changed_at_ms: self.clock.now_ms(),
            restored,
        };
        self.store.append(Stream::AgentConfigs, &record, true).await?;

        let id = next.id.clone();
        let version = next.config_version;
        self.agents
            .write()
            .await
            .insert(id.clone(), Arc::new(next));
        self.persist_current().await?;

        let event = core_event(
            event_types::AGENT_CONFIG_UPDATED,
            "agent_registry",
            EventSeverity::Info,
        )
        .durable(true)
        .with_agent(id)
        .with_field("version", version)
        .with_field("restored", restored);
        let _ = self.bus.emit(event).await;
        Ok(())
    }

    /// Stats fast path; never bumps `config_version`.
    pub async fn stats_for(&self, id: &AgentId) -> Option<Arc<AgentStats>> {
        self.stats.read().await.get(id).cloned()
    }

    pub async fn stats_snapshot(&self, id: &AgentId) -> Option<AgentStatsSnapshot> {
        Some(self.stats.read().await.get(id)?.snapshot())
    }

    /// Agents whose eligible task types include `task_type`.
    pub async fn eligible_for(&self, task_type: &str) -> Vec<Arc<AgentConfig>> {
        let mut out: Vec<_> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.handles_type(task_type))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

/// Field-level diff between two configs, for proposals and audit payloads.
pub fn diff_configs(before: &AgentConfig, after: &AgentConfig) -> Vec<FieldChange> {
    let mut diff = Vec::new();
    if before.model_id != after.model_id {
        diff.push(FieldChange::new(
            "model_id",
            before.model_id.clone(),
            after.model_id.clone(),
        ));
    }
    if before.thinking_level != after.thinking_level {
        diff.push(FieldChange::new(
            "thinking_level",
            before.thinking_level.as_str(),
            after.thinking_level.as_str(),
        ));
    }
    if before.timeout_default_ms != after.timeout_default_ms {
        diff.push(FieldChange::new(
            "timeout_default_ms",
            before.timeout_default_ms,
            after.timeout_default_ms,
        ));
    }
    if before.system_prompt != after.system_prompt {
        diff.push(FieldChange::new(
            "system_prompt",
            before.system_prompt.clone(),
            after.system_prompt.clone(),
        ));
    }
    if before.tool_permissions != after.tool_permissions {
        diff.push(FieldChange::new(
            "tool_permissions",
            json!(before.tool_permissions),
            json!(after.tool_permissions),
        ));
    }
    if before.task_types != after.task_types {
        diff.push(FieldChange::new(
            "task_types",
            json!(before.task_types),
            json!(after.task_types),
        ));
    }
    if before.capabilities != after.capabilities {
        diff.push(FieldChange::new(
            "capabilities",
            json!(before.capabilities),
            json!(after.capabilities),
        ));
    }
    if before.max_in_flight != after.max_in_flight {
        diff.push(FieldChange::new(
            "max_in_flight",
            before.max_in_flight,
            after.max_in_flight,
        ));
    }
    if before.priority_class != after.priority_class {
        diff.push(FieldChange::new(
            "priority_class",
            before.priority_class.as_str(),
            after.priority_class.as_str(),
        ));
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Env, ThinkingLevel};
    use crate::domain::ports::SystemClock;
    use crate::services::event_bus::EventBusConfig;
    use crate::services::event_store::StoreConfig;
    use std::time::Duration;

    struct Fixture {
        registry: AgentRegistry,
        vault: Arc<SnapshotVault>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = EventStore::open(StoreConfig::new(dir.path())).unwrap();
        let store = Arc::new(store);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let bus = EventBus::new(store.clone(), clock.clone(), Env::Test, EventBusConfig::default());
        let vault = Arc::new(SnapshotVault::new(store.clone(), 16));
        let registry = AgentRegistry::new(vault.clone(), store, bus, clock);
        Fixture {
            registry,
            vault,
            _dir: dir,
        }
    }

    fn coder() -> AgentConfig {
        AgentConfig::named("coder-A", "coder")
            .task_types(&["code"])
            .timeout_default(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let f = fixture();
        f.registry.register(coder()).await.unwrap();

        let agent = f.registry.get(&AgentId::new("coder-A")).await.unwrap();
        assert_eq!(agent.role_name, "coder");
        assert_eq!(agent.config_version, 1);

        assert!(matches!(
            f.registry.register(coder()).await,
            Err(RegistryError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_snapshots() {
        let f = fixture();
        f.registry.register(coder()).await.unwrap();
        let id = AgentId::new("coder-A");

        let patch = AgentPatch {
            timeout_default_ms: Some(45_000),
            ..Default::default()
        };
        let v2 = f
            .registry
            .update(&id, &patch, SnapshotReason::ConfigUpdate)
            .await
            .unwrap();
        assert_eq!(v2, 2);

        let live = f.registry.get(&id).await.unwrap();
        assert_eq!(live.timeout_default_ms, 45_000);

        // Pre-change config was deposited with the vault
        let snapshot = f.vault.latest(&id).await.unwrap();
        assert_eq!(snapshot.config.timeout_default_ms, 60_000);
        assert_eq!(snapshot.config.config_version, 1);
    }

    #[tokio::test]
    async fn test_update_then_restore_round_trips_content() {
        let f = fixture();
        f.registry.register(coder()).await.unwrap();
        let id = AgentId::new("coder-A");

        let patch = AgentPatch {
            thinking_level: Some(ThinkingLevel::High),
            ..Default::default()
        };
        f.registry
            .update(&id, &patch, SnapshotReason::ConfigUpdate)
            .await
            .unwrap();

        let snapshot = f.vault.latest(&id).await.unwrap();
        let v3 = f.registry.restore(&snapshot.config).await.unwrap();
        assert_eq!(v3, 3);

        let live = f.registry.get(&id).await.unwrap();
        assert!(live.same_content(&snapshot.config));
    }

    #[tokio::test]
    async fn test_empty_patch_rejected() {
        let f = fixture();
        f.registry.register(coder()).await.unwrap();
        let err = f
            .registry
            .update(
                &AgentId::new("coder-A"),
                &AgentPatch::default(),
                SnapshotReason::ConfigUpdate,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::EmptyPatch(_)));
    }

    #[tokio::test]
    async fn test_stats_fast_path_does_not_bump_version() {
        let f = fixture();
        f.registry.register(coder()).await.unwrap();
        let id = AgentId::new("coder-A");

        let stats = f.registry.stats_for(&id).await.unwrap();
        stats.record_success(5000);
        stats.record_success(7000);
        stats.record_failure(1000, 42);

        let snap = f.registry.stats_snapshot(&id).await.unwrap();
        assert_eq!(snap.tasks_completed, 2);
        assert_eq!(snap.tasks_failed, 1);
        assert!((snap.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snap.last_failure_ms, Some(42));

        assert_eq!(f.registry.get(&id).await.unwrap().config_version, 1);
    }

    #[tokio::test]
    async fn test_diff_configs() {
        let before = coder();
        let patch = AgentPatch {
            timeout_default_ms: Some(90_000),
            thinking_level: Some(ThinkingLevel::High),
            ..Default::default()
        };
        let after = patch.apply_to(&before);
        let diff = diff_configs(&before, &after);
        assert_eq!(diff.len(), 2);
        assert!(diff.iter().any(|c| c.field == "timeout_default_ms"));
        assert!(diff.iter().any(|c| c.field == "thinking_level"));
    }

    #[tokio::test]
    async fn test_eligible_for() {
        let f = fixture();
        f.registry.register(coder()).await.unwrap();
        f.registry
            .register(
                AgentConfig::named("reviewer-A", "reviewer").task_types(&["review"]),
            )
            .await
            .unwrap();

        let eligible = f.registry.eligible_for("code").await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id.as_str(), "coder-A");
    }
}
