//! Playbook domain model.
//!
//! A playbook is a declarative remediation rule: an event trigger with an
//! optional condition over the payload, an ordered list of actions, a verify
//! predicate, and optional rollback actions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::event::{Event, EventPattern, EventTypeError};

/// Identifier for a playbook, human-named in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaybookId(pub String);

impl PlaybookId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlaybookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Risk classification for remediation and configuration changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// One level up, saturating at `Critical`.
    pub fn escalated(&self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

/// Condition predicate evaluated over an event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Eq { field: String, value: Value },
    Gt { field: String, value: f64 },
    Gte { field: String, value: f64 },
    Lt { field: String, value: f64 },
    Lte { field: String, value: f64 },
    /// Regex match against a string field.
    Matches { field: String, pattern: String },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
}

impl Condition {
    fn numeric(payload: &Map<String, Value>, field: &str) -> Option<f64> {
        payload.get(field).and_then(Value::as_f64)
    }

    pub fn evaluate(&self, payload: &Map<String, Value>) -> bool {
        match self {
            Self::Eq { field, value } => payload.get(field) == Some(value),
            Self::Gt { field, value } => {
                Self::numeric(payload, field).is_some_and(|v| v > *value)
            }
            Self::Gte { field, value } => {
                Self::numeric(payload, field).is_some_and(|v| v >= *value)
            }
            Self::Lt { field, value } => {
                Self::numeric(payload, field).is_some_and(|v| v < *value)
            }
            Self::Lte { field, value } => {
                Self::numeric(payload, field).is_some_and(|v| v <= *value)
            }
            Self::Matches { field, pattern } => payload
                .get(field)
                .and_then(Value::as_str)
                .zip(regex::Regex::new(pattern).ok())
                .is_some_and(|(s, re)| re.is_match(s)),
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(payload)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(payload)),
        }
    }

    /// Validate regex patterns up front so bad playbooks fail at load time.
    pub fn validate(&self) -> Result<(), PlaybookError> {
        match self {
            Self::Matches { pattern, .. } => regex::Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| PlaybookError::InvalidRegex(pattern.clone(), e.to_string())),
            Self::All { conditions } | Self::Any { conditions } => {
                conditions.iter().try_for_each(Condition::validate)
            }
            _ => Ok(()),
        }
    }
}

/// Event trigger: a type pattern plus an optional payload condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Trigger {
    pub fn matches(&self, event: &Event) -> bool {
        let Ok(pattern) = EventPattern::parse(&self.pattern) else {
            return false;
        };
        if !pattern.matches(&event.event_type) {
            return false;
        }
        self.condition
            .as_ref()
            .is_none_or(|c| c.evaluate(&event.payload))
    }
}

/// Action types the reactor knows how to dispatch to registered handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "config.update")]
    ConfigUpdate,
    #[serde(rename = "agent.restart")]
    AgentRestart,
    #[serde(rename = "notify")]
    Notify,
    #[serde(rename = "exec.command")]
    ExecCommand,
    #[serde(rename = "scheduler.enqueue")]
    SchedulerEnqueue,
    #[serde(rename = "rollback.trigger")]
    RollbackTrigger,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigUpdate => "config.update",
            Self::AgentRestart => "agent.restart",
            Self::Notify => "notify",
            Self::ExecCommand => "exec.command",
            Self::SchedulerEnqueue => "scheduler.enqueue",
            Self::RollbackTrigger => "rollback.trigger",
        }
    }
}

/// One declarative action inside a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    #[serde(rename = "action")]
    pub kind: ActionKind,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ActionDescriptor {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            params: Map::new(),
            timeout_ms: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Post-action verification: metric X within bound Y within time window W.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifySpec {
    pub metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub below: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub above: Option<f64>,
    pub within_ms: u64,
}

impl VerifySpec {
    pub fn satisfied_by(&self, value: f64) -> bool {
        self.below.is_none_or(|b| value < b) && self.above.is_none_or(|a| value > a)
    }
}

/// Validation errors for playbook definitions.
#[derive(Debug, Error)]
pub enum PlaybookError {
    #[error("playbook {0}: auto_execute requires risk_class=low, got {1}")]
    AutoExecuteRisk(PlaybookId, &'static str),

    #[error("playbook {0}: empty action list")]
    NoActions(PlaybookId),

    #[error("playbook {0}: invalid trigger pattern: {1}")]
    InvalidTrigger(PlaybookId, EventTypeError),

    #[error("invalid regex {0:?}: {1}")]
    InvalidRegex(String, String),

    #[error("failed to parse playbook definitions: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read playbook file: {0}")]
    Io(#[from] std::io::Error),
}

/// Declarative remediation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: PlaybookId,
    pub name: String,
    pub trigger: Trigger,
    pub actions: Vec<ActionDescriptor>,
    pub risk_class: RiskClass,
    #[serde(default)]
    pub auto_execute: bool,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifySpec>,
    #[serde(default)]
    pub rollback_actions: Vec<ActionDescriptor>,
    /// When set, matching continues past this playbook.
    #[serde(default)]
    pub multi_match: bool,
}

impl Playbook {
    pub fn validate(&self) -> Result<(), PlaybookError> {
        if self.auto_execute && self.risk_class != RiskClass::Low {
            return Err(PlaybookError::AutoExecuteRisk(
                self.id.clone(),
                self.risk_class.as_str(),
            ));
        }
        if self.actions.is_empty() {
            return Err(PlaybookError::NoActions(self.id.clone()));
        }
        EventPattern::parse(&self.trigger.pattern)
            .map_err(|e| PlaybookError::InvalidTrigger(self.id.clone(), e))?;
        if let Some(cond) = &self.trigger.condition {
            cond.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::event::{EventSeverity, EventType};

    fn event_with(value: i64) -> Event {
        Event::new(
            EventType::parse("resource.cpu.high").unwrap(),
            "monitor",
            EventSeverity::Warning,
        )
        .with_field("value", value)
        .with_field("host", "workstation")
    }

    fn minimal_playbook(id: &str) -> Playbook {
        Playbook {
            id: PlaybookId::new(id),
            name: id.to_string(),
            trigger: Trigger {
                pattern: "resource.*".to_string(),
                condition: None,
            },
            actions: vec![ActionDescriptor::new(ActionKind::Notify)],
            risk_class: RiskClass::Low,
            auto_execute: true,
            cooldown_ms: 0,
            verify: None,
            rollback_actions: vec![],
            multi_match: false,
        }
    }

    #[test]
    fn test_condition_numeric() {
        let payload = event_with(95).payload;
        assert!(Condition::Gt {
            field: "value".to_string(),
            value: 90.0
        }
        .evaluate(&payload));
        assert!(!Condition::Lt {
            field: "value".to_string(),
            value: 90.0
        }
        .evaluate(&payload));
        // Missing field never matches
        assert!(!Condition::Gt {
            field: "missing".to_string(),
            value: 0.0
        }
        .evaluate(&payload));
    }

    #[test]
    fn test_condition_regex_and_combinators() {
        let payload = event_with(95).payload;
        let cond = Condition::All {
            conditions: vec![
                Condition::Matches {
                    field: "host".to_string(),
                    pattern: "^work".to_string(),
                },
                Condition::Gte {
                    field: "value".to_string(),
                    value: 95.0,
                },
            ],
        };
        assert!(cond.evaluate(&payload));
    }

    #[test]
    fn test_trigger_pattern_and_condition() {
        let trigger = Trigger {
            pattern: "resource.*".to_string(),
            condition: Some(Condition::Gt {
                field: "value".to_string(),
                value: 90.0,
            }),
        };
        assert!(trigger.matches(&event_with(95)));
        assert!(!trigger.matches(&event_with(50)));
    }

    #[test]
    fn test_auto_execute_requires_low_risk() {
        let mut pb = minimal_playbook("reduce_heartbeat");
        assert!(pb.validate().is_ok());

        pb.risk_class = RiskClass::Medium;
        assert!(matches!(
            pb.validate(),
            Err(PlaybookError::AutoExecuteRisk(_, _))
        ));
    }

    #[test]
    fn test_verify_bounds() {
        let spec = VerifySpec {
            metric: "cpu".to_string(),
            below: Some(80.0),
            above: None,
            within_ms: 1000,
        };
        assert!(spec.satisfied_by(70.0));
        assert!(!spec.satisfied_by(85.0));
    }

    #[test]
    fn test_action_kind_wire_names() {
        let json = serde_json::to_string(&ActionKind::ConfigUpdate).unwrap();
        assert_eq!(json, "\"config.update\"");
        let back: ActionKind = serde_json::from_str("\"scheduler.enqueue\"").unwrap();
        assert_eq!(back, ActionKind::SchedulerEnqueue);
    }

    #[test]
    fn test_risk_escalation() {
        assert_eq!(RiskClass::Low.escalated(), RiskClass::Medium);
        assert_eq!(RiskClass::Critical.escalated(), RiskClass::Critical);
    }
}
