// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::context::{ContextKey, ContextKind};
use crate::domain::lifecycle::{ErrorContext, LifecycleEvent, SwarmLifecycleState};
use crate::domain::resource::LedgerEntry;
use crate::domain::subscription::SubscriptionId;
use crate::domain::swarm::SwarmId;

/// Audit trail published for every committed kernel state change.
///
/// These are emitted after the commit point, so a consumer never observes an
/// event for a change that did not persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuditEvent {
    SwarmCreated {
        swarm_id: SwarmId,
        goal: String,
        created_by: String,
        created_at: DateTime<Utc>,
    },
    LifecycleTransitioned {
        swarm_id: SwarmId,
        from: SwarmLifecycleState,
        to: SwarmLifecycleState,
        event: LifecycleEvent,
        actor: String,
        reason: Option<String>,
        error: Option<ErrorContext>,
        transitioned_at: DateTime<Utc>,
    },
    ContextCommitted {
        swarm_id: SwarmId,
        key: ContextKey,
        kind: ContextKind,
        version: u64,
        actor: String,
        warnings: usize,
        committed_at: DateTime<Utc>,
    },
    LedgerRecorded {
        swarm_id: SwarmId,
        entry: LedgerEntry,
        remaining: u64,
    },
    SubscriberEvicted {
        swarm_id: SwarmId,
        subscription_id: SubscriptionId,
        queued: usize,
        evicted_at: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn swarm_id(&self) -> SwarmId {
        match self {
            Self::SwarmCreated { swarm_id, .. }
            | Self::LifecycleTransitioned { swarm_id, .. }
            | Self::ContextCommitted { swarm_id, .. }
            | Self::LedgerRecorded { swarm_id, .. }
            | Self::SubscriberEvicted { swarm_id, .. } => *swarm_id,
        }
    }

    /// Short event name, used as a log/metric label.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SwarmCreated { .. } => "swarm_created",
            Self::LifecycleTransitioned { .. } => "lifecycle_transitioned",
            Self::ContextCommitted { .. } => "context_committed",
            Self::LedgerRecorded { .. } => "ledger_recorded",
            Self::SubscriberEvicted { .. } => "subscriber_evicted",
        }
    }
}
