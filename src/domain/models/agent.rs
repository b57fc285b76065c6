//! Agent domain model.
//!
//! An agent is a configurable execution role: a model, a prompt, tool
//! permissions, and eligibility for a set of task types. The live record is
//! versioned so configuration changes can be rolled back.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::task::TaskPriority;

/// Unique identifier for an agent. Agents are addressed by human-readable
/// names such as `coder-A`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Execution environment label. Test agents and their traces never feed the
/// production self-improvement loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    Prod,
    Test,
}

impl Default for Env {
    fn default() -> Self {
        Self::Prod
    }
}

impl Env {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prod => "prod",
            Self::Test => "test",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "prod" | "production" => Some(Self::Prod),
            "test" => Some(Self::Test),
            _ => None,
        }
    }
}

/// How much deliberation the agent's model is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    Low,
    Medium,
    High,
}

impl Default for ThinkingLevel {
    fn default() -> Self {
        Self::Low
    }
}

impl ThinkingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Next level up, saturating at `High`.
    pub fn raised(&self) -> Self {
        match self {
            Self::Off => Self::Low,
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
        }
    }
}

/// Versioned configuration record for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: AgentId,
    pub role_name: String,
    /// Task types this agent is eligible for.
    pub task_types: Vec<String>,
    pub model_id: String,
    #[serde(default)]
    pub thinking_level: ThinkingLevel,
    pub timeout_default_ms: u64,
    pub system_prompt: String,
    #[serde(default)]
    pub tool_permissions: Vec<String>,
    #[serde(default)]
    pub priority_class: TaskPriority,
    /// Capability keywords matched against task descriptions during routing.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Maximum concurrent tasks dispatched to this agent.
    #[serde(default = "AgentConfig::default_max_in_flight")]
    pub max_in_flight: u32,
    /// Provider key for rate limiting.
    #[serde(default = "AgentConfig::default_provider")]
    pub provider: String,
    /// Critical agents get lower self-improvement trigger thresholds.
    #[serde(default)]
    pub critical: bool,
    /// Strictly increases on every mutation.
    pub config_version: u64,
    #[serde(default)]
    pub env: Env,
}

impl AgentConfig {
    fn default_max_in_flight() -> u32 {
        2
    }

    fn default_provider() -> String {
        "default".to_string()
    }

    /// Minimal config with sensible defaults, builder-extended from there.
    pub fn named(id: impl Into<String>, role_name: impl Into<String>) -> Self {
        Self {
            id: AgentId::new(id),
            role_name: role_name.into(),
            task_types: Vec::new(),
            model_id: "default-model".to_string(),
            thinking_level: ThinkingLevel::default(),
            timeout_default_ms: 60_000,
            system_prompt: String::new(),
            tool_permissions: Vec::new(),
            priority_class: TaskPriority::default(),
            capabilities: Vec::new(),
            max_in_flight: Self::default_max_in_flight(),
            provider: Self::default_provider(),
            critical: false,
            config_version: 1,
            env: Env::default(),
        }
    }

    pub fn task_types(mut self, types: &[&str]) -> Self {
        self.task_types = types.iter().map(|s| (*s).to_string()).collect();
        self
    }

    pub fn model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn thinking(mut self, level: ThinkingLevel) -> Self {
        self.thinking_level = level;
        self
    }

    pub fn timeout_default(mut self, timeout: Duration) -> Self {
        self.timeout_default_ms = timeout.as_millis() as u64;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn capabilities(mut self, keywords: &[&str]) -> Self {
        self.capabilities = keywords.iter().map(|s| (*s).to_string()).collect();
        self
    }

    pub fn max_in_flight(mut self, n: u32) -> Self {
        self.max_in_flight = n;
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_default_ms)
    }

    pub fn handles_type(&self, task_type: &str) -> bool {
        self.task_types.iter().any(|t| t == task_type)
    }

    /// Content equality ignoring the version counter. Used by rollback to
    /// decide whether a revert would be a no-op.
    pub fn same_content(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.config_version = 0;
        b.config_version = 0;
        a == b
    }
}

/// Partial update applied to an [`AgentConfig`] through the registry.
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<ThinkingLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_default_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<TaskPriority>,
}

impl AgentPatch {
    pub fn is_empty(&self) -> bool {
        self.model_id.is_none()
            && self.thinking_level.is_none()
            && self.timeout_default_ms.is_none()
            && self.system_prompt.is_none()
            && self.tool_permissions.is_none()
            && self.task_types.is_none()
            && self.capabilities.is_none()
            && self.max_in_flight.is_none()
            && self.priority_class.is_none()
    }

    /// Apply this patch to a config, returning the modified copy.
    pub fn apply_to(&self, config: &AgentConfig) -> AgentConfig {
        let mut next = config.clone();
        if let Some(ref v) = self.model_id {
            next.model_id = v.clone();
        }
        if let Some(v) = self.thinking_level {
            next.thinking_level = v;
        }
        if let Some(v) = self.timeout_default_ms {
            next.timeout_default_ms = v;
        }
        if let Some(ref v) = self.system_prompt {
            next.system_prompt = v.clone();
        }
        if let Some(ref v) = self.tool_permissions {
            next.tool_permissions = v.clone();
        }
        if let Some(ref v) = self.task_types {
            next.task_types = v.clone();
        }
        if let Some(ref v) = self.capabilities {
            next.capabilities = v.clone();
        }
        if let Some(v) = self.max_in_flight {
            next.max_in_flight = v;
        }
        if let Some(v) = self.priority_class {
            next.priority_class = v;
        }
        next
    }
}

/// Point-in-time view of an agent's execution statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStatsSnapshot {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_ms: Option<i64>,
}
