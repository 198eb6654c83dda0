// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Shared Context (Blackboard) Values
//!
//! The blackboard stores heterogeneous items. Instead of an open map of JSON
//! values, every item is a [`ContextValue`], a tagged variant with a typed
//! payload, so validators and subscribers can match on it exhaustively.
//! Free-form agent data still has a home under the `data/` namespace.
//!
//! | Key | Kind | Payload |
//! |-----|------|---------|
//! | `config` | `Config` | [`SwarmConfig`] |
//! | `team` | `Team` | [`TeamDescriptor`] |
//! | `resources` | `Resources` | [`ResourceLedger`] |
//! | `policy` | `Policy` | [`PolicyDocument`] |
//! | `execution_state` | `ExecutionState` | [`ExecutionState`] |
//! | `data/<name>` | `Data` | arbitrary JSON |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::domain::lifecycle::ErrorContext;
use crate::domain::resource::ResourceLedger;
use crate::domain::swarm::{Actor, SwarmConfig, TeamDescriptor};
use crate::domain::validation::ValidationIssue;

const DATA_PREFIX: &str = "data/";
const MAX_KEY_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid context key '{key}': {reason}")]
pub struct InvalidKey {
    pub key: String,
    pub reason: String,
}

/// Name of a blackboard item. Always one of the well-known keys or `data/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContextKey(String);

impl ContextKey {
    pub const CONFIG: &'static str = "config";
    pub const TEAM: &'static str = "team";
    pub const RESOURCES: &'static str = "resources";
    pub const POLICY: &'static str = "policy";
    pub const EXECUTION_STATE: &'static str = "execution_state";

    pub fn parse(key: impl Into<String>) -> Result<Self, InvalidKey> {
        let key = key.into();
        let reject = |reason: &str| InvalidKey {
            key: key.clone(),
            reason: reason.to_string(),
        };

        if key.is_empty() {
            return Err(reject("key cannot be empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(reject("key is longer than 256 bytes"));
        }
        if key.starts_with("__") {
            return Err(reject("keys starting with '__' are reserved"));
        }
        if Self::well_known_kind(&key).is_some() {
            return Ok(Self(key));
        }

        let Some(name) = key.strip_prefix(DATA_PREFIX) else {
            return Err(reject("free-form keys must live under 'data/'"));
        };
        if name.is_empty() {
            return Err(reject("data key needs a name after 'data/'"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
        {
            return Err(reject("data key may only contain [A-Za-z0-9_-./]"));
        }
        Ok(Self(key))
    }

    pub fn config() -> Self {
        Self(Self::CONFIG.to_string())
    }

    pub fn team() -> Self {
        Self(Self::TEAM.to_string())
    }

    pub fn resources() -> Self {
        Self(Self::RESOURCES.to_string())
    }

    pub fn policy() -> Self {
        Self(Self::POLICY.to_string())
    }

    pub fn execution_state() -> Self {
        Self(Self::EXECUTION_STATE.to_string())
    }

    pub fn data(name: &str) -> Result<Self, InvalidKey> {
        Self::parse(format!("{DATA_PREFIX}{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The value kind this key must hold.
    pub fn kind(&self) -> ContextKind {
        Self::well_known_kind(&self.0).unwrap_or(ContextKind::Data)
    }

    fn well_known_kind(key: &str) -> Option<ContextKind> {
        match key {
            Self::CONFIG => Some(ContextKind::Config),
            Self::TEAM => Some(ContextKind::Team),
            Self::RESOURCES => Some(ContextKind::Resources),
            Self::POLICY => Some(ContextKind::Policy),
            Self::EXECUTION_STATE => Some(ContextKind::ExecutionState),
            _ => None,
        }
    }
}

impl TryFrom<String> for ContextKey {
    type Error = InvalidKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ContextKey> for String {
    fn from(key: ContextKey) -> Self {
        key.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discriminator of a [`ContextValue`], also used as the key namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Config,
    Team,
    Resources,
    Policy,
    ExecutionState,
    Data,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Team => "team",
            Self::Resources => "resources",
            Self::Policy => "policy",
            Self::ExecutionState => "execution_state",
            Self::Data => "data",
        };
        f.write_str(name)
    }
}

/// Tagged value stored in a blackboard item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ContextValue {
    Config(SwarmConfig),
    Team(TeamDescriptor),
    Resources(ResourceLedger),
    Policy(PolicyDocument),
    ExecutionState(ExecutionState),
    Data(Value),
}

impl ContextValue {
    pub fn kind(&self) -> ContextKind {
        match self {
            Self::Config(_) => ContextKind::Config,
            Self::Team(_) => ContextKind::Team,
            Self::Resources(_) => ContextKind::Resources,
            Self::Policy(_) => ContextKind::Policy,
            Self::ExecutionState(_) => ContextKind::ExecutionState,
            Self::Data(_) => ContextKind::Data,
        }
    }

    /// The untagged payload as JSON.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Config(v) => serde_json::to_value(v),
            Self::Team(v) => serde_json::to_value(v),
            Self::Resources(v) => serde_json::to_value(v),
            Self::Policy(v) => serde_json::to_value(v),
            Self::ExecutionState(v) => serde_json::to_value(v),
            Self::Data(v) => Ok(v.clone()),
        }
    }

    /// Decode an untagged payload into the variant for `kind`.
    pub fn from_payload(kind: ContextKind, payload: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            ContextKind::Config => Self::Config(serde_json::from_value(payload)?),
            ContextKind::Team => Self::Team(serde_json::from_value(payload)?),
            ContextKind::Resources => Self::Resources(serde_json::from_value(payload)?),
            ContextKind::Policy => Self::Policy(serde_json::from_value(payload)?),
            ContextKind::ExecutionState => Self::ExecutionState(serde_json::from_value(payload)?),
            ContextKind::Data => Self::Data(payload),
        })
    }

    pub fn as_config(&self) -> Option<&SwarmConfig> {
        match self {
            Self::Config(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_team(&self) -> Option<&TeamDescriptor> {
        match self {
            Self::Team(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_resources(&self) -> Option<&ResourceLedger> {
        match self {
            Self::Resources(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_policy(&self) -> Option<&PolicyDocument> {
        match self {
            Self::Policy(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_execution_state(&self) -> Option<&ExecutionState> {
        match self {
            Self::ExecutionState(v) => Some(v),
            _ => None,
        }
    }
}

/// A proposed change to one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum ContextMutation {
    /// Replace the whole value.
    Set(ContextValue),
    /// RFC 7396 JSON merge patch applied to the current payload.
    Patch(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Failed,
}

/// Execution bookkeeping shared across tiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    #[serde(default)]
    pub status: ExecutionStatus,
    /// Work items currently being executed.
    #[serde(default)]
    pub in_flight: u32,
    /// Copied from the swarm config at creation so the parallelism limit can
    /// be checked without a second read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Set when the swarm fails; explains why.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorContext>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEffect {
    Allow,
    Deny,
    RequireApproval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    /// Exact action name, or a prefix pattern ending in `*`.
    pub action: String,
    pub effect: PolicyEffect,
}

impl PolicyRule {
    pub fn matches(&self, action: &str) -> bool {
        match self.action.strip_suffix('*') {
            Some(prefix) => action.starts_with(prefix),
            None => self.action == action,
        }
    }
}

/// Tool/action approval policy for the swarm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl PolicyDocument {
    /// First matching rule wins; otherwise falls back on `auto_approve`.
    pub fn evaluate(&self, action: &str) -> PolicyEffect {
        self.rules
            .iter()
            .find(|rule| rule.matches(action))
            .map(|rule| rule.effect)
            .unwrap_or(if self.auto_approve {
                PolicyEffect::Allow
            } else {
                PolicyEffect::RequireApproval
            })
    }
}

/// A committed blackboard item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackboardItem {
    pub key: ContextKey,
    pub value: ContextValue,
    /// Strictly increases on every committed mutation; first commit is 1.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Actor,
    /// Non-blocking validation findings attached at commit time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ValidationIssue>,
}

impl BlackboardItem {
    pub fn metadata(&self) -> ItemMetadata {
        ItemMetadata {
            key: self.key.clone(),
            kind: self.value.kind(),
            version: self.version,
            updated_at: self.updated_at,
            updated_by: self.updated_by.clone(),
            has_warnings: !self.warnings.is_empty(),
        }
    }
}

/// What subscription predicates get to see about an item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemMetadata {
    pub key: ContextKey,
    pub kind: ContextKind,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Actor,
    pub has_warnings: bool,
}

/// Apply an RFC 7396 merge patch to `target` in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (name, value) in patch_map {
            if value.is_null() {
                target_map.remove(name);
            } else {
                merge_patch(target_map.entry(name.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_parsing() {
        assert_eq!(ContextKey::parse("config").unwrap().kind(), ContextKind::Config);
        assert_eq!(ContextKey::parse("data/plan/v2").unwrap().kind(), ContextKind::Data);
        assert!(ContextKey::parse("").is_err());
        assert!(ContextKey::parse("__lifecycle").is_err());
        assert!(ContextKey::parse("plan").is_err());
        assert!(ContextKey::parse("data/").is_err());
        assert!(ContextKey::parse("data/has space").is_err());
    }

    #[test]
    fn test_key_deserialization_validates() {
        let ok: ContextKey = serde_json::from_value(json!("policy")).unwrap();
        assert_eq!(ok, ContextKey::policy());
        assert!(serde_json::from_value::<ContextKey>(json!("__secret")).is_err());
    }

    #[test]
    fn test_value_is_tagged() {
        let value = ContextValue::Data(json!({"step": 1}));
        let encoded = serde_json::to_value(&value).unwrap();
        assert_eq!(encoded, json!({"kind": "data", "payload": {"step": 1}}));

        let policy = ContextValue::Policy(PolicyDocument::default());
        let decoded: ContextValue = serde_json::from_value(serde_json::to_value(&policy).unwrap()).unwrap();
        assert_eq!(decoded.kind(), ContextKind::Policy);
    }

    #[test]
    fn test_payload_roundtrip_through_kind() {
        let state = ExecutionState {
            in_flight: 3,
            ..ExecutionState::default()
        };
        let value = ContextValue::ExecutionState(state.clone());
        let payload = value.payload().unwrap();
        let back = ContextValue::from_payload(ContextKind::ExecutionState, payload).unwrap();
        assert_eq!(back.as_execution_state(), Some(&state));
    }

    #[test]
    fn test_wrong_shape_payload_is_rejected() {
        let result = ContextValue::from_payload(ContextKind::Team, json!({"members": "nobody"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_merge_patch() {
        let mut doc = json!({"a": 1, "b": {"c": 2, "d": 3}});
        merge_patch(&mut doc, &json!({"a": null, "b": {"c": 20}, "e": [1]}));
        assert_eq!(doc, json!({"b": {"c": 20, "d": 3}, "e": [1]}));

        let mut scalar = json!(5);
        merge_patch(&mut scalar, &json!({"x": 1}));
        assert_eq!(scalar, json!({"x": 1}));
    }

    #[test]
    fn test_policy_evaluation() {
        let policy = PolicyDocument {
            auto_approve: false,
            rules: vec![
                PolicyRule {
                    id: "no-shell".into(),
                    action: "tool.shell*".into(),
                    effect: PolicyEffect::Deny,
                },
                PolicyRule {
                    id: "read".into(),
                    action: "tool.read_file".into(),
                    effect: PolicyEffect::Allow,
                },
            ],
        };
        assert_eq!(policy.evaluate("tool.shell.exec"), PolicyEffect::Deny);
        assert_eq!(policy.evaluate("tool.read_file"), PolicyEffect::Allow);
        assert_eq!(policy.evaluate("tool.write_file"), PolicyEffect::RequireApproval);
    }
}
