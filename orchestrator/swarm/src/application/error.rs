// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::context::{ContextKey, InvalidKey};
use crate::domain::lifecycle::{LifecycleEvent, SwarmLifecycleState};
use crate::domain::repository::StoreError;
use crate::domain::resource::{ResourceError, ResourceKind};
use crate::domain::state_machine::TransitionError;
use crate::domain::swarm::{SwarmId, Tier};
use crate::domain::validation::ValidationResult;

/// Every error a kernel operation can return.
///
/// `Conflict` and `Busy` are expected under contention and should be retried
/// with a fresh read. `GuardFailed` and `Invalid` are actionable feedback for
/// the calling tier.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("no transition for '{event}' in state {from}")]
    InvalidTransition {
        from: SwarmLifecycleState,
        event: LifecycleEvent,
    },

    #[error("guard rejected '{event}' in state {from}: {reason}")]
    GuardFailed {
        from: SwarmLifecycleState,
        event: LifecycleEvent,
        reason: String,
    },

    #[error("transition hook failed: {0}")]
    HookFailed(String),

    #[error("context item '{0}' not found")]
    NotFound(ContextKey),

    #[error("version conflict on '{key}': expected {expected}, current {current}")]
    Conflict { key: ContextKey, expected: u64, current: u64 },

    #[error("proposal rejected: {0}")]
    Invalid(ValidationResult),

    #[error("insufficient {kind} for {tier} tier: requested {requested}, remaining {remaining}")]
    InsufficientRemaining {
        kind: ResourceKind,
        tier: Tier,
        requested: u64,
        remaining: u64,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("swarm {0} is busy with another transition")]
    Busy(SwarmId),

    #[error("operation cancelled")]
    Cancelled,

    #[error("swarm {0} not found")]
    SwarmNotFound(SwarmId),

    #[error("swarm {0} already exists")]
    SwarmExists(SwarmId),

    #[error("malformed subscription filter: {0}")]
    MalformedFilter(String),

    #[error(transparent)]
    MalformedKey(#[from] InvalidKey),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

impl KernelError {
    /// Whether retrying with fresh state can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Busy(_))
    }
}

impl From<TransitionError<SwarmLifecycleState, LifecycleEvent>> for KernelError {
    fn from(err: TransitionError<SwarmLifecycleState, LifecycleEvent>) -> Self {
        match err {
            TransitionError::InvalidTransition { from, event } => Self::InvalidTransition { from, event },
            TransitionError::GuardFailed { from, event, reason } => Self::GuardFailed { from, event, reason },
            hook @ TransitionError::HookFailed { .. } => Self::HookFailed(hook.to_string()),
        }
    }
}

impl From<ResourceError> for KernelError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::InsufficientRemaining {
                kind,
                tier,
                requested,
                remaining,
                ..
            } => Self::InsufficientRemaining {
                kind,
                tier,
                requested,
                remaining,
            },
            other => {
                let mut result = ValidationResult::ok();
                result.push_error("payload", other.to_string());
                Self::Invalid(result)
            }
        }
    }
}
