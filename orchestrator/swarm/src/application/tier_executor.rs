// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Tier Executor Port
//!
//! The only way coordination, process and execution tiers touch swarm state.
//! Tiers hold a [`TierHandle`](crate::application::kernel::TierHandle) or an
//! `Arc<dyn TierExecutorPort>`, never the blackboard or the store directly.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::application::call::CallContext;
use crate::application::error::KernelError;
use crate::application::subscription_manager::{ContextSubscriber, SubscriptionHandle};
use crate::domain::context::{BlackboardItem, ContextKey, ContextMutation};
use crate::domain::lifecycle::{ErrorContext, LifecycleEvent, LifecycleTransition};
use crate::domain::resource::{LedgerEntry, ResourceKind};
use crate::domain::subscription::{ContextChange, SubscribeOptions, SubscriptionFilter};
use crate::domain::swarm::{SwarmId, Tier};

#[async_trait]
pub trait TierExecutorPort: Send + Sync {
    /// Apply a lifecycle event. `fail` must go through
    /// [`report_failure`](Self::report_failure) so an error context is attached.
    async fn request_transition(
        &self,
        swarm_id: SwarmId,
        event: LifecycleEvent,
        reason: Option<String>,
        ctx: &CallContext,
    ) -> Result<LifecycleTransition, KernelError>;

    /// Fail the swarm and persist `error` on its `execution_state` item.
    async fn report_failure(
        &self,
        swarm_id: SwarmId,
        error: ErrorContext,
        ctx: &CallContext,
    ) -> Result<LifecycleTransition, KernelError>;

    async fn read_context(&self, swarm_id: SwarmId, key: &ContextKey, ctx: &CallContext)
        -> Result<BlackboardItem, KernelError>;

    /// Compare-and-swap one context item. The `resources` item is refused
    /// with `Invalid`; budgets move only through the resource operations.
    async fn propose_context(
        &self,
        swarm_id: SwarmId,
        key: ContextKey,
        expected_version: u64,
        mutation: ContextMutation,
        ctx: &CallContext,
    ) -> Result<BlackboardItem, KernelError>;

    async fn subscribe(
        &self,
        swarm_id: SwarmId,
        filter: SubscriptionFilter,
        subscriber: Arc<dyn ContextSubscriber>,
        options: SubscribeOptions,
        ctx: &CallContext,
    ) -> Result<SubscriptionHandle, KernelError>;

    /// Like [`subscribe`](Self::subscribe), delivering into a bounded channel.
    /// Dropping the receiver ends the subscription.
    async fn subscribe_channel(
        &self,
        swarm_id: SwarmId,
        filter: SubscriptionFilter,
        options: SubscribeOptions,
        ctx: &CallContext,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<ContextChange>), KernelError>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> bool;

    /// Debit the caller's tier. Returns the entry and the pool's remaining total.
    async fn consume_resource(
        &self,
        swarm_id: SwarmId,
        kind: ResourceKind,
        amount: u64,
        ctx: &CallContext,
    ) -> Result<(LedgerEntry, u64), KernelError>;

    async fn transfer_resource(
        &self,
        swarm_id: SwarmId,
        kind: ResourceKind,
        amount: u64,
        from: Tier,
        to: Tier,
        ctx: &CallContext,
    ) -> Result<LedgerEntry, KernelError>;
}
