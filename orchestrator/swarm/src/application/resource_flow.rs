// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Resource Flow
//!
//! Allocation, consumption and inter-tier transfer of swarm budgets.
//!
//! Every operation is a single compare-and-swap of the `resources` item,
//! retried on conflict with a fresh read. A request rejected by a hard pool
//! that has nothing left fails the swarm. Over-sized requests against a pool
//! that still holds budget, and soft pools, only reject the request.
//!
//! | Operation     | Tier debited/credited          | Exhaustion check |
//! |---------------|--------------------------------|------------------|
//! | `allocate`    | coordination (credited)        | no               |
//! | `allocate_to` | explicit tier (credited)       | no               |
//! | `consume`     | caller's tier (debited)        | yes              |
//! | `transfer`    | `from` debited, `to` credited  | yes              |

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::application::blackboard::BlackboardService;
use crate::application::call::CallContext;
use crate::application::error::KernelError;
use crate::application::lifecycle::LifecycleService;
use crate::domain::context::{ContextKey, ContextValue};
use crate::domain::events::AuditEvent;
use crate::domain::lifecycle::{ErrorContext, LifecycleEvent};
use crate::domain::repository::StoreError;
use crate::domain::resource::{LedgerEntry, LimitMode, ResourceError, ResourceKind, ResourceLedger};
use crate::domain::swarm::{SwarmId, Tier};
use crate::infrastructure::event_bus::AuditEventBus;
use crate::infrastructure::telemetry;

pub struct ResourceFlowService {
    blackboard: Arc<BlackboardService>,
    lifecycle: Arc<LifecycleService>,
    audit: AuditEventBus,
    max_cas_retries: u32,
}

impl ResourceFlowService {
    pub fn new(
        blackboard: Arc<BlackboardService>,
        lifecycle: Arc<LifecycleService>,
        audit: AuditEventBus,
        max_cas_retries: u32,
    ) -> Self {
        Self {
            blackboard,
            lifecycle,
            audit,
            max_cas_retries,
        }
    }

    /// Credit `amount` to the coordination tier, creating the pool with
    /// `limit` if this is the first allocation for `kind`.
    pub async fn allocate(
        &self,
        swarm_id: SwarmId,
        kind: ResourceKind,
        amount: u64,
        limit: LimitMode,
        ctx: &CallContext,
    ) -> Result<LedgerEntry, KernelError> {
        self.allocate_to(swarm_id, kind, amount, Tier::Coordination, limit, ctx)
            .await
    }

    pub async fn allocate_to(
        &self,
        swarm_id: SwarmId,
        kind: ResourceKind,
        amount: u64,
        tier: Tier,
        limit: LimitMode,
        ctx: &CallContext,
    ) -> Result<LedgerEntry, KernelError> {
        let actor = ctx.actor.clone();
        let (entry, _) = self
            .apply(swarm_id, ctx, |ledger| ledger.allocate(kind, amount, tier, limit, &actor))
            .await?;
        Ok(entry)
    }

    /// Debit the caller's tier. Returns the ledger entry and what is left in
    /// the swarm-wide pool.
    pub async fn consume(
        &self,
        swarm_id: SwarmId,
        kind: ResourceKind,
        amount: u64,
        ctx: &CallContext,
    ) -> Result<(LedgerEntry, u64), KernelError> {
        let actor = ctx.actor.clone();
        let (entry, ledger) = self
            .apply(swarm_id, ctx, |ledger| ledger.consume(kind, amount, &actor))
            .await?;
        let remaining = ledger.remaining(kind);

        metrics::counter!(
            telemetry::RESOURCE_CONSUMED_TOTAL,
            "kind" => kind.to_string(),
            "tier" => entry.tier.to_string()
        )
        .increment(amount);
        if let Some(pool) = ledger.pool(kind) {
            if pool.limit == LimitMode::Soft && pool.is_exhausted() {
                warn!(swarm_id = %swarm_id, kind = %kind, "Soft {} pool is exhausted", kind);
            }
        }
        Ok((entry, remaining))
    }

    pub async fn transfer(
        &self,
        swarm_id: SwarmId,
        kind: ResourceKind,
        amount: u64,
        from: Tier,
        to: Tier,
        ctx: &CallContext,
    ) -> Result<LedgerEntry, KernelError> {
        let actor = ctx.actor.clone();
        let (entry, _) = self
            .apply(swarm_id, ctx, |ledger| ledger.transfer(kind, amount, from, to, &actor))
            .await?;
        Ok(entry)
    }

    /// Current pools and ledger. An empty ledger if nothing was allocated.
    pub async fn snapshot(&self, swarm_id: SwarmId, ctx: &CallContext) -> Result<ResourceLedger, KernelError> {
        let item = self
            .blackboard
            .try_read(swarm_id, &ContextKey::resources(), ctx)
            .await?;
        Ok(item
            .and_then(|item| item.value.as_resources().cloned())
            .unwrap_or_default())
    }

    async fn apply<F>(
        &self,
        swarm_id: SwarmId,
        ctx: &CallContext,
        operation: F,
    ) -> Result<(LedgerEntry, ResourceLedger), KernelError>
    where
        F: Fn(&ResourceLedger) -> Result<(ResourceLedger, LedgerEntry), ResourceError> + Send + Sync,
    {
        let mut recorded: Option<LedgerEntry> = None;
        let mut rejected: Option<ResourceError> = None;

        let outcome = self
            .blackboard
            .update(swarm_id, ContextKey::resources(), self.max_cas_retries, ctx, |current| {
                recorded = None;
                rejected = None;
                let ledger = current
                    .and_then(ContextValue::as_resources)
                    .cloned()
                    .unwrap_or_default();
                match operation(&ledger) {
                    Ok((next, entry)) => {
                        recorded = Some(entry);
                        Ok(ContextValue::Resources(next))
                    }
                    Err(e) => {
                        rejected = Some(e.clone());
                        Err(e.into())
                    }
                }
            })
            .await;

        let item = match outcome {
            Ok(item) => item,
            Err(err) => {
                if let Some(rejection) = rejected {
                    if rejection.is_hard_exhaustion() {
                        self.exhausted(swarm_id, &rejection, ctx).await;
                    }
                }
                return Err(err);
            }
        };

        let entry = recorded
            .ok_or_else(|| StoreError::Backend("committed ledger is missing its new entry".to_string()))?;
        let ledger = item.value.as_resources().cloned().unwrap_or_default();
        let remaining = ledger.remaining(entry.kind);

        info!(
            swarm_id = %swarm_id,
            kind = %entry.kind,
            amount = entry.amount,
            tier = %entry.tier,
            remaining,
            "Resource ledger entry recorded"
        );
        self.audit.publish(AuditEvent::LedgerRecorded {
            swarm_id,
            entry: entry.clone(),
            remaining,
        });
        Ok((entry, ledger))
    }

    /// Fail the swarm after its hard pool ran dry. Runs as the kernel,
    /// unaffected by the caller's cancellation.
    async fn exhausted(&self, swarm_id: SwarmId, rejection: &ResourceError, ctx: &CallContext) {
        let ResourceError::InsufficientRemaining {
            kind,
            tier,
            requested,
            pool_remaining,
            ..
        } = rejection
        else {
            return;
        };

        let kernel_ctx = ctx.as_kernel();
        match self.lifecycle.state(swarm_id, &kernel_ctx).await {
            Ok(state) if state.is_terminal() => return,
            Ok(_) => {}
            Err(e) => {
                warn!(swarm_id = %swarm_id, "Could not read lifecycle state after exhaustion: {}", e);
                return;
            }
        }

        let error = ErrorContext::resource_exhausted(*kind, *requested, *pool_remaining, *tier);
        warn!(swarm_id = %swarm_id, kind = %kind, "{}", error.message);
        let mut attempts = 0;
        loop {
            let outcome = self
                .lifecycle
                .request_transition(
                    swarm_id,
                    LifecycleEvent::Fail,
                    Some(error.kind.to_string()),
                    Some(error.clone()),
                    &kernel_ctx,
                )
                .await;
            match outcome {
                Ok(_) => return,
                Err(e) if e.is_retryable() && attempts < self.max_cas_retries => {
                    attempts += 1;
                    debug!(swarm_id = %swarm_id, attempt = attempts, "Retrying exhaustion failure: {}", e);
                }
                // Someone else already moved the swarm to a terminal state
                Err(KernelError::InvalidTransition { from, .. }) if from.is_terminal() => return,
                Err(e) => {
                    error!(swarm_id = %swarm_id, kind = %kind, "Could not fail swarm after pool exhaustion: {}", e);
                    return;
                }
            }
        }
    }
}
