// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Context Validation
//!
//! Pure checks run against every proposed blackboard mutation before it is
//! committed. Validators never fail by returning `Err`; they accumulate
//! [`ValidationIssue`]s into a [`ValidationResult`]. Errors block the commit,
//! warnings are attached to the committed item.
//!
//! | Validator | Applies to | Checks |
//! |-----------|------------|--------|
//! | [`KeyShapeValidator`] | all keys | value kind matches the key namespace |
//! | [`ConfigValidator`] | `config` | goal, temperature, parallelism; immutable once written |
//! | [`TeamValidator`] | `team` | unique agent ids, consistent active count |
//! | [`ResourceValidator`] | `resources` | pool arithmetic, append-only ledger, soft-limit warnings |
//! | [`PolicyValidator`] | `policy` | rule ids present and unique |
//! | [`ExecutionStateValidator`] | `execution_state` | failure carries an error context, parallelism warnings |

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::domain::context::{ContextKey, ContextValue, ExecutionStatus};
use crate::domain::resource::LimitMode;
use crate::domain::swarm::SwarmConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// One finding, tagged with the offending field path (e.g. `payload.temperature`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn push_error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue::error(path, message));
    }

    pub fn push_warning(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue::warning(path, message));
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "valid ({} warning(s))", self.warnings.len());
        }
        let joined: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        f.write_str(&joined.join("; "))
    }
}

/// A check applied to a proposed value. `previous` is `None` when the key is new.
pub trait ContextValidator: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, key: &ContextKey, previous: Option<&ContextValue>, proposed: &ContextValue) -> ValidationResult;
}

/// Field-level checks on a swarm configuration. Shared with the lifecycle
/// `initialize` guard.
pub fn validate_config(config: &SwarmConfig) -> ValidationResult {
    let mut result = ValidationResult::ok();
    if config.goal.trim().is_empty() {
        result.push_error("payload.goal", "goal cannot be empty");
    }
    if config.model.trim().is_empty() {
        result.push_error("payload.model", "model cannot be empty");
    }
    if !(0.0..=2.0).contains(&config.temperature) {
        result.push_error(
            "payload.temperature",
            format!("temperature {} is outside 0.0..=2.0", config.temperature),
        );
    }
    if config.max_parallel == 0 {
        result.push_error("payload.max_parallel", "max_parallel must be at least 1");
    }
    result
}

pub struct KeyShapeValidator;

impl ContextValidator for KeyShapeValidator {
    fn name(&self) -> &'static str {
        "key_shape"
    }

    fn validate(&self, key: &ContextKey, _previous: Option<&ContextValue>, proposed: &ContextValue) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if key.kind() != proposed.kind() {
            result.push_error("kind", format!("key '{key}' holds {} values, got {}", key.kind(), proposed.kind()));
        }
        result
    }
}

pub struct ConfigValidator;

impl ContextValidator for ConfigValidator {
    fn name(&self) -> &'static str {
        "config"
    }

    fn validate(&self, _key: &ContextKey, previous: Option<&ContextValue>, proposed: &ContextValue) -> ValidationResult {
        let Some(config) = proposed.as_config() else {
            return ValidationResult::ok();
        };
        let mut result = validate_config(config);
        if let Some(before) = previous.and_then(ContextValue::as_config) {
            if before != config {
                result.push_error("payload", "swarm configuration is immutable once written");
            }
        }
        result
    }
}

pub struct TeamValidator;

impl ContextValidator for TeamValidator {
    fn name(&self) -> &'static str {
        "team"
    }

    fn validate(&self, _key: &ContextKey, _previous: Option<&ContextValue>, proposed: &ContextValue) -> ValidationResult {
        let Some(team) = proposed.as_team() else {
            return ValidationResult::ok();
        };
        let mut result = ValidationResult::ok();
        let mut seen = HashSet::new();
        for (i, member) in team.members.iter().enumerate() {
            if !seen.insert(member.agent_id) {
                result.push_error(
                    format!("payload.members[{i}].agent_id"),
                    format!("agent {} appears more than once", member.agent_id),
                );
            }
            if member.role.trim().is_empty() {
                result.push_error(format!("payload.members[{i}].role"), "role cannot be empty");
            }
        }
        if team.active_members != team.counted_active() {
            result.push_error(
                "payload.active_members",
                format!(
                    "active_members is {} but {} roster entries are active",
                    team.active_members,
                    team.counted_active()
                ),
            );
        }
        result
    }
}

pub struct ResourceValidator {
    soft_warning_ratio: f64,
}

impl ResourceValidator {
    pub fn new(soft_warning_ratio: f64) -> Self {
        Self { soft_warning_ratio }
    }
}

impl ContextValidator for ResourceValidator {
    fn name(&self) -> &'static str {
        "resources"
    }

    fn validate(&self, _key: &ContextKey, previous: Option<&ContextValue>, proposed: &ContextValue) -> ValidationResult {
        let Some(ledger) = proposed.as_resources() else {
            return ValidationResult::ok();
        };
        let mut result = ValidationResult::ok();

        for (kind, pool) in &ledger.pools {
            let path = format!("payload.pools.{kind}");
            if pool.kind != *kind {
                result.push_error(format!("{path}.kind"), format!("pool is filed under {kind} but declares {}", pool.kind));
            }
            if pool.consumed > pool.allocated {
                result.push_error(
                    format!("{path}.consumed"),
                    format!("consumed {} exceeds allocated {}", pool.consumed, pool.allocated),
                );
            }
            let tier_allocated: u128 = pool.tiers.values().map(|b| u128::from(b.allocated)).sum();
            let tier_consumed: u128 = pool.tiers.values().map(|b| u128::from(b.consumed)).sum();
            if tier_allocated != u128::from(pool.allocated) || tier_consumed != u128::from(pool.consumed) {
                result.push_error(format!("{path}.tiers"), "tier balances do not sum to the pool totals");
            }
            for (tier, balance) in &pool.tiers {
                if balance.consumed > balance.allocated {
                    result.push_error(
                        format!("{path}.tiers.{tier}"),
                        format!("{tier} tier consumed {} of {} allocated", balance.consumed, balance.allocated),
                    );
                }
            }
            if pool.limit == LimitMode::Soft && pool.allocated > 0 {
                let ratio = pool.remaining() as f64 / pool.allocated as f64;
                if ratio < self.soft_warning_ratio {
                    result.push_warning(
                        format!("{path}.remaining"),
                        format!("soft {kind} pool is down to {} of {}", pool.remaining(), pool.allocated),
                    );
                }
            }
        }

        if let Some(before) = previous.and_then(ContextValue::as_resources) {
            let prefix_kept = before.entries.len() <= ledger.entries.len()
                && before.entries.iter().zip(&ledger.entries).all(|(a, b)| a == b);
            if !prefix_kept {
                result.push_error("payload.entries", "ledger entries are append-only");
            }
        }
        for (i, pair) in ledger.entries.windows(2).enumerate() {
            if pair[1].sequence <= pair[0].sequence {
                result.push_error(format!("payload.entries[{}].sequence", i + 1), "ledger sequence must increase");
            }
        }

        if result.is_valid() {
            if let Err(err) = ledger.reconcile() {
                result.push_error("payload.entries", err.to_string());
            }
        }
        result
    }
}

pub struct PolicyValidator;

impl ContextValidator for PolicyValidator {
    fn name(&self) -> &'static str {
        "policy"
    }

    fn validate(&self, _key: &ContextKey, _previous: Option<&ContextValue>, proposed: &ContextValue) -> ValidationResult {
        let Some(policy) = proposed.as_policy() else {
            return ValidationResult::ok();
        };
        let mut result = ValidationResult::ok();
        let mut seen = HashSet::new();
        for (i, rule) in policy.rules.iter().enumerate() {
            if rule.id.trim().is_empty() {
                result.push_error(format!("payload.rules[{i}].id"), "rule id cannot be empty");
            } else if !seen.insert(rule.id.as_str()) {
                result.push_error(format!("payload.rules[{i}].id"), format!("duplicate rule id '{}'", rule.id));
            }
            if rule.action.is_empty() {
                result.push_error(format!("payload.rules[{i}].action"), "rule action cannot be empty");
            }
        }
        result
    }
}

pub struct ExecutionStateValidator;

impl ContextValidator for ExecutionStateValidator {
    fn name(&self) -> &'static str {
        "execution_state"
    }

    fn validate(&self, _key: &ContextKey, _previous: Option<&ContextValue>, proposed: &ContextValue) -> ValidationResult {
        let Some(state) = proposed.as_execution_state() else {
            return ValidationResult::ok();
        };
        let mut result = ValidationResult::ok();
        if state.status == ExecutionStatus::Failed && state.error.is_none() {
            result.push_error("payload.error", "a failed execution must carry an error context");
        }
        if let Some(limit) = state.max_parallel {
            if state.in_flight > limit {
                result.push_warning(
                    "payload.in_flight",
                    format!("{} items in flight exceeds max_parallel {limit}", state.in_flight),
                );
            }
        }
        if state.status == ExecutionStatus::Completed && state.in_flight > 0 {
            result.push_warning("payload.in_flight", "execution completed with work still in flight");
        }
        result
    }
}

/// Ordered set of validators applied to every proposal.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: Vec<Arc<dyn ContextValidator>>,
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.validators.iter().map(|v| v.name()).collect();
        f.debug_struct("ValidatorRegistry").field("validators", &names).finish()
    }
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in validators for every well-known namespace.
    pub fn standard(soft_warning_ratio: f64) -> Self {
        Self::new()
            .with(KeyShapeValidator)
            .with(ConfigValidator)
            .with(TeamValidator)
            .with(ResourceValidator::new(soft_warning_ratio))
            .with(PolicyValidator)
            .with(ExecutionStateValidator)
    }

    pub fn with(mut self, validator: impl ContextValidator + 'static) -> Self {
        self.register(Arc::new(validator));
        self
    }

    pub fn register(&mut self, validator: Arc<dyn ContextValidator>) {
        self.validators.push(validator);
    }

    pub fn validate(&self, key: &ContextKey, previous: Option<&ContextValue>, proposed: &ContextValue) -> ValidationResult {
        let mut result = ValidationResult::ok();
        for validator in &self.validators {
            result.merge(validator.validate(key, previous, proposed));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::{ExecutionState, PolicyDocument, PolicyEffect, PolicyRule};
    use crate::domain::lifecycle::{ErrorContext, ErrorKind};
    use crate::domain::resource::{ResourceKind, ResourceLedger};
    use crate::domain::swarm::{Actor, AgentId, TeamDescriptor, TeamMember, Tier};
    use serde_json::json;

    fn registry() -> ValidatorRegistry {
        ValidatorRegistry::standard(0.1)
    }

    #[test]
    fn test_kind_must_match_namespace() {
        let result = registry().validate(
            &ContextKey::policy(),
            None,
            &ContextValue::Data(json!({"rules": []})),
        );
        assert!(!result.is_valid());
        assert_eq!(result.errors[0].path, "kind");
    }

    #[test]
    fn test_config_is_checked_and_immutable() {
        let key = ContextKey::config();
        let mut bad = SwarmConfig::new("", "model");
        bad.temperature = 3.5;
        let result = registry().validate(&key, None, &ContextValue::Config(bad));
        let paths: Vec<&str> = result.errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["payload.goal", "payload.temperature"]);

        let original = ContextValue::Config(SwarmConfig::new("goal", "model"));
        let changed = ContextValue::Config(SwarmConfig::new("another goal", "model"));
        assert!(registry().validate(&key, None, &original).is_valid());
        assert!(registry().validate(&key, Some(&original), &original).is_valid());
        assert!(!registry().validate(&key, Some(&original), &changed).is_valid());
    }

    #[test]
    fn test_team_rejects_duplicates_and_bad_counts() {
        let id = AgentId::new();
        let mut team = TeamDescriptor::new();
        team.members.push(TeamMember::new(id, "a"));
        team.members.push(TeamMember::new(id, "b"));
        team.active_members = 5;

        let result = registry().validate(&ContextKey::team(), None, &ContextValue::Team(team));
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_resources_reject_rewritten_history() {
        let actor = Actor::new("coordinator", Tier::Coordination);
        let (funded, _) = ResourceLedger::new()
            .allocate(ResourceKind::Credits, 100, Tier::Coordination, LimitMode::Hard, &actor)
            .unwrap();
        let (spent, _) = funded.consume(ResourceKind::Credits, 10, &actor).unwrap();
        let key = ContextKey::resources();

        let previous = ContextValue::Resources(spent.clone());
        assert!(registry().validate(&key, Some(&ContextValue::Resources(funded.clone())), &previous).is_valid());

        let mut rewritten = spent;
        rewritten.entries.pop();
        rewritten.pools.get_mut(&ResourceKind::Credits).unwrap().consumed = 0;
        rewritten
            .pools
            .get_mut(&ResourceKind::Credits)
            .unwrap()
            .tiers
            .get_mut(&Tier::Coordination)
            .unwrap()
            .consumed = 0;
        let result = registry().validate(&key, Some(&previous), &ContextValue::Resources(rewritten));
        assert!(result.errors.iter().any(|e| e.message.contains("append-only")));
    }

    #[test]
    fn test_resources_with_overflowing_entries_are_rejected() {
        let actor = Actor::new("coordinator", Tier::Coordination);
        let (funded, _) = ResourceLedger::new()
            .allocate(ResourceKind::Credits, 10, Tier::Coordination, LimitMode::Hard, &actor)
            .unwrap();
        let mut forged = funded;
        let mut huge = forged.entries[0].clone();
        huge.sequence = 2;
        huge.amount = u64::MAX;
        let mut small = huge.clone();
        small.sequence = 3;
        small.amount = 6;
        forged.entries.extend([huge, small]);

        let result = registry().validate(&ContextKey::resources(), None, &ContextValue::Resources(forged));
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.path == "payload.entries"));
    }

    #[test]
    fn test_soft_pool_warns_when_running_low() {
        let actor = Actor::new("coordinator", Tier::Coordination);
        let (funded, _) = ResourceLedger::new()
            .allocate(ResourceKind::Tokens, 100, Tier::Coordination, LimitMode::Soft, &actor)
            .unwrap();
        let (low, _) = funded.consume(ResourceKind::Tokens, 95, &actor).unwrap();

        let result = registry().validate(&ContextKey::resources(), None, &ContextValue::Resources(low));
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_policy_rule_ids_are_unique() {
        let rule = PolicyRule {
            id: "r1".into(),
            action: "tool.*".into(),
            effect: PolicyEffect::Allow,
        };
        let policy = PolicyDocument {
            auto_approve: false,
            rules: vec![rule.clone(), rule],
        };
        let result = registry().validate(&ContextKey::policy(), None, &ContextValue::Policy(policy));
        assert!(result.to_string().contains("duplicate rule id"));
    }

    #[test]
    fn test_failed_execution_needs_error() {
        let key = ContextKey::execution_state();
        let mut state = ExecutionState {
            status: ExecutionStatus::Failed,
            ..ExecutionState::default()
        };
        assert!(!registry()
            .validate(&key, None, &ContextValue::ExecutionState(state.clone()))
            .is_valid());

        state.error = Some(ErrorContext::new(ErrorKind::ToolFailure, "tool crashed", Tier::Execution));
        assert!(registry().validate(&key, None, &ContextValue::ExecutionState(state)).is_valid());
    }

    #[test]
    fn test_custom_validator_can_be_registered() {
        struct NoSecrets;
        impl ContextValidator for NoSecrets {
            fn name(&self) -> &'static str {
                "no_secrets"
            }
            fn validate(&self, _: &ContextKey, _: Option<&ContextValue>, proposed: &ContextValue) -> ValidationResult {
                let mut result = ValidationResult::ok();
                if let ContextValue::Data(value) = proposed {
                    if value.get("password").is_some() {
                        result.push_error("payload.password", "secrets are not allowed on the blackboard");
                    }
                }
                result
            }
        }

        let registry = registry().with(NoSecrets);
        let key = ContextKey::data("notes").unwrap();
        assert!(!registry
            .validate(&key, None, &ContextValue::Data(json!({"password": "hunter2"})))
            .is_valid());
    }
}
