// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Kernel
//!
//! Facade wiring the blackboard, subscription manager, lifecycle and resource
//! services over one injected [`StateStore`].
//!
//! ```text
//! TierHandle ──► SwarmKernel (TierExecutorPort)
//!                  ├─ LifecycleService ──────┐
//!                  ├─ ResourceFlowService ───┤
//!                  └─ BlackboardService ─────┴─► StateStore
//!                        └─ SubscriptionManager ─► subscriber workers
//!                  AuditEventBus ◄── every committed change
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::application::blackboard::BlackboardService;
use crate::application::call::CallContext;
use crate::application::error::KernelError;
use crate::application::lifecycle::{LifecycleService, TransitionHook};
use crate::application::resource_flow::ResourceFlowService;
use crate::application::subscription_manager::{
    ChannelSubscriber, ContextSubscriber, SubscriptionHandle, SubscriptionManager,
};
use crate::application::tier_executor::TierExecutorPort;
use crate::domain::context::{
    BlackboardItem, ContextKey, ContextMutation, ContextValue, ExecutionState, PolicyDocument,
};
use crate::domain::events::AuditEvent;
use crate::domain::kernel_config::KernelConfig;
use crate::domain::lifecycle::{ErrorContext, ErrorKind, LifecycleEvent, LifecycleTransition, SwarmLifecycleState};
use crate::domain::repository::StateStore;
use crate::domain::resource::{LedgerEntry, LimitMode, ResourceKind, ResourceLedger};
use crate::domain::subscription::{ContextChange, SubscribeOptions, SubscriptionFilter};
use crate::domain::swarm::{Actor, Swarm, SwarmConfig, SwarmId, TeamDescriptor, TeamMember, Tier};
use crate::domain::validation::{validate_config, ContextValidator, ValidationResult, ValidatorRegistry};
use crate::infrastructure::event_bus::{AuditEventBus, AuditReceiver};

/// Initial budget for one resource kind, credited to the coordination tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBudget {
    pub kind: ResourceKind,
    pub amount: u64,
    pub limit: LimitMode,
}

impl ResourceBudget {
    pub fn hard(kind: ResourceKind, amount: u64) -> Self {
        Self {
            kind,
            amount,
            limit: LimitMode::Hard,
        }
    }

    pub fn soft(kind: ResourceKind, amount: u64) -> Self {
        Self {
            kind,
            amount,
            limit: LimitMode::Soft,
        }
    }
}

pub struct KernelBuilder {
    store: Arc<dyn StateStore>,
    config: KernelConfig,
    hooks: Vec<Arc<dyn TransitionHook>>,
    validators: Vec<Arc<dyn ContextValidator>>,
}

impl KernelBuilder {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            config: KernelConfig::default(),
            hooks: Vec::new(),
            validators: Vec::new(),
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hook(mut self, hook: Arc<dyn TransitionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Extra validator run after the standard set.
    pub fn validator(mut self, validator: Arc<dyn ContextValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn build(self) -> SwarmKernel {
        let config = self.config;
        let retries = config.operations.max_cas_retries;
        let audit = AuditEventBus::new(config.audit.capacity);

        let mut validators = ValidatorRegistry::standard(config.resources.soft_warning_ratio);
        for validator in self.validators {
            validators.register(validator);
        }

        let subscriptions = Arc::new(SubscriptionManager::new(&config.subscriptions, audit.clone()));
        let blackboard = Arc::new(BlackboardService::new(
            self.store.clone(),
            validators,
            subscriptions.clone(),
            audit.clone(),
        ));
        let lifecycle = Arc::new(LifecycleService::new(
            self.store,
            blackboard.clone(),
            self.hooks,
            audit.clone(),
            retries,
        ));
        let resources = Arc::new(ResourceFlowService::new(
            blackboard.clone(),
            lifecycle.clone(),
            audit.clone(),
            retries,
        ));

        SwarmKernel {
            config: Arc::new(config),
            audit,
            subscriptions,
            blackboard,
            lifecycle,
            resources,
        }
    }
}

/// Entry point for hosts and tiers. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SwarmKernel {
    config: Arc<KernelConfig>,
    audit: AuditEventBus,
    subscriptions: Arc<SubscriptionManager>,
    blackboard: Arc<BlackboardService>,
    lifecycle: Arc<LifecycleService>,
    resources: Arc<ResourceFlowService>,
}

impl SwarmKernel {
    pub fn new(store: Arc<dyn StateStore>, config: KernelConfig) -> Self {
        KernelBuilder::new(store).config(config).build()
    }

    pub fn builder(store: Arc<dyn StateStore>) -> KernelBuilder {
        KernelBuilder::new(store)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Call context for `actor` using the configured default timeout.
    pub fn call_context(&self, actor: Actor) -> CallContext {
        CallContext::new(actor).with_timeout(self.config.operations.default_timeout)
    }

    /// Seed a new swarm and return its id. The swarm starts `UNINITIALIZED`;
    /// it only becomes visible once every item has been written.
    pub async fn create_swarm(
        &self,
        config: SwarmConfig,
        budgets: Vec<ResourceBudget>,
        ctx: &CallContext,
    ) -> Result<SwarmId, KernelError> {
        let checked = validate_config(&config);
        if !checked.is_valid() {
            return Err(KernelError::Invalid(checked));
        }

        let swarm_id = SwarmId::new();
        let execution = ExecutionState {
            max_parallel: Some(config.max_parallel),
            ..ExecutionState::default()
        };
        let policy = PolicyDocument {
            auto_approve: config.auto_approve,
            rules: Vec::new(),
        };
        let goal = config.goal.clone();

        let seeds = [
            (ContextKey::config(), ContextValue::Config(config)),
            (ContextKey::team(), ContextValue::Team(TeamDescriptor::new())),
            (ContextKey::policy(), ContextValue::Policy(policy)),
            (ContextKey::execution_state(), ContextValue::ExecutionState(execution)),
        ];
        for (key, value) in seeds {
            self.blackboard
                .propose(swarm_id, key, 0, ContextMutation::Set(value), ctx)
                .await?;
        }

        if budgets.is_empty() {
            self.blackboard
                .propose(
                    swarm_id,
                    ContextKey::resources(),
                    0,
                    ContextMutation::Set(ContextValue::Resources(ResourceLedger::new())),
                    ctx,
                )
                .await?;
        }
        for budget in budgets {
            self.resources
                .allocate(swarm_id, budget.kind, budget.amount, budget.limit, ctx)
                .await?;
        }

        self.lifecycle.initialize_record(swarm_id, ctx).await?;

        info!(swarm_id = %swarm_id, actor = %ctx.actor, "Swarm created");
        self.audit.publish(AuditEvent::SwarmCreated {
            swarm_id,
            goal,
            created_by: ctx.actor.to_string(),
            created_at: chrono::Utc::now(),
        });
        Ok(swarm_id)
    }

    /// Add or replace a roster entry.
    pub async fn join_team(
        &self,
        swarm_id: SwarmId,
        member: TeamMember,
        ctx: &CallContext,
    ) -> Result<BlackboardItem, KernelError> {
        self.ensure_swarm(swarm_id, ctx).await?;
        self.blackboard
            .update(
                swarm_id,
                ContextKey::team(),
                self.config.operations.max_cas_retries,
                ctx,
                |current| {
                    let mut team = current.and_then(ContextValue::as_team).cloned().unwrap_or_default();
                    team.upsert_member(member.clone());
                    Ok(ContextValue::Team(team))
                },
            )
            .await
    }

    /// Adjust `execution_state.in_flight` by `delta`. Going below zero is rejected.
    pub async fn set_in_flight(
        &self,
        swarm_id: SwarmId,
        delta: i64,
        ctx: &CallContext,
    ) -> Result<ExecutionState, KernelError> {
        self.ensure_swarm(swarm_id, ctx).await?;
        let item = self
            .blackboard
            .update(
                swarm_id,
                ContextKey::execution_state(),
                self.config.operations.max_cas_retries,
                ctx,
                |current| {
                    let mut state = current
                        .and_then(ContextValue::as_execution_state)
                        .cloned()
                        .unwrap_or_default();
                    let next = i64::from(state.in_flight) + delta;
                    state.in_flight = u32::try_from(next).map_err(|_| {
                        let mut result = ValidationResult::ok();
                        result.push_error("in_flight", format!("cannot move in-flight count to {next}"));
                        KernelError::Invalid(result)
                    })?;
                    Ok(ContextValue::ExecutionState(state))
                },
            )
            .await?;
        Ok(item.value.as_execution_state().cloned().unwrap_or_default())
    }

    /// Extra budget for an existing swarm, credited to the coordination tier.
    pub async fn allocate(
        &self,
        swarm_id: SwarmId,
        budget: ResourceBudget,
        ctx: &CallContext,
    ) -> Result<LedgerEntry, KernelError> {
        self.ensure_swarm(swarm_id, ctx).await?;
        self.resources
            .allocate(swarm_id, budget.kind, budget.amount, budget.limit, ctx)
            .await
    }

    pub async fn allocate_to(
        &self,
        swarm_id: SwarmId,
        budget: ResourceBudget,
        tier: Tier,
        ctx: &CallContext,
    ) -> Result<LedgerEntry, KernelError> {
        self.ensure_swarm(swarm_id, ctx).await?;
        self.resources
            .allocate_to(swarm_id, budget.kind, budget.amount, tier, budget.limit, ctx)
            .await
    }

    pub async fn resources(&self, swarm_id: SwarmId, ctx: &CallContext) -> Result<ResourceLedger, KernelError> {
        self.resources.snapshot(swarm_id, ctx).await
    }

    pub async fn state(&self, swarm_id: SwarmId, ctx: &CallContext) -> Result<SwarmLifecycleState, KernelError> {
        self.lifecycle.state(swarm_id, ctx).await
    }

    pub async fn history(&self, swarm_id: SwarmId, ctx: &CallContext) -> Result<Vec<LifecycleTransition>, KernelError> {
        self.lifecycle.history(swarm_id, ctx).await
    }

    /// Every public blackboard item, sorted by key.
    pub async fn snapshot(&self, swarm_id: SwarmId, ctx: &CallContext) -> Result<Vec<BlackboardItem>, KernelError> {
        self.ensure_swarm(swarm_id, ctx).await?;
        self.blackboard.snapshot(swarm_id, ctx).await
    }

    /// Read-only aggregate assembled from the lifecycle record and the
    /// swarm's items.
    pub async fn swarm(&self, swarm_id: SwarmId, ctx: &CallContext) -> Result<Swarm, KernelError> {
        let state = self.lifecycle.state(swarm_id, ctx).await?;
        let mut swarm = Swarm {
            id: swarm_id,
            state,
            config: None,
            team: TeamDescriptor::default(),
            resources: ResourceLedger::default(),
            policy: None,
            execution: ExecutionState::default(),
        };
        for item in self.blackboard.snapshot(swarm_id, ctx).await? {
            match item.value {
                ContextValue::Config(config) => swarm.config = Some(config),
                ContextValue::Team(team) => swarm.team = team,
                ContextValue::Resources(ledger) => swarm.resources = ledger,
                ContextValue::Policy(policy) => swarm.policy = Some(policy),
                ContextValue::ExecutionState(execution) => swarm.execution = execution,
                ContextValue::Data(_) => {}
            }
        }
        Ok(swarm)
    }

    /// Lifecycle transitions, ledger entries and other audit events of every swarm.
    pub fn audit_stream(&self) -> AuditReceiver {
        self.audit.subscribe()
    }

    pub fn audit_stream_for(&self, swarm_id: SwarmId) -> AuditReceiver {
        self.audit.subscribe_swarm(swarm_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.subscriber_count()
    }

    /// Capability handle for one tier actor on one swarm.
    pub fn handle(&self, swarm_id: SwarmId, actor: Actor) -> TierHandle {
        TierHandle {
            kernel: self.clone(),
            swarm_id,
            ctx: self.call_context(actor),
        }
    }

    /// Stop every subscriber worker.
    pub fn shutdown(&self) {
        self.subscriptions.shutdown();
    }

    async fn ensure_swarm(&self, swarm_id: SwarmId, ctx: &CallContext) -> Result<(), KernelError> {
        self.lifecycle.state(swarm_id, ctx).await.map(|_| ())
    }
}

#[async_trait]
impl TierExecutorPort for SwarmKernel {
    async fn request_transition(
        &self,
        swarm_id: SwarmId,
        event: LifecycleEvent,
        reason: Option<String>,
        ctx: &CallContext,
    ) -> Result<LifecycleTransition, KernelError> {
        self.lifecycle
            .request_transition(swarm_id, event, reason, None, ctx)
            .await
    }

    async fn report_failure(
        &self,
        swarm_id: SwarmId,
        error: ErrorContext,
        ctx: &CallContext,
    ) -> Result<LifecycleTransition, KernelError> {
        let reason = Some(error.kind.to_string());
        self.lifecycle
            .request_transition(swarm_id, LifecycleEvent::Fail, reason, Some(error), ctx)
            .await
    }

    async fn read_context(
        &self,
        swarm_id: SwarmId,
        key: &ContextKey,
        ctx: &CallContext,
    ) -> Result<BlackboardItem, KernelError> {
        self.blackboard.read(swarm_id, key, ctx).await
    }

    async fn propose_context(
        &self,
        swarm_id: SwarmId,
        key: ContextKey,
        expected_version: u64,
        mutation: ContextMutation,
        ctx: &CallContext,
    ) -> Result<BlackboardItem, KernelError> {
        if key == ContextKey::resources() {
            let mut result = ValidationResult::ok();
            result.push_error("key", "resources change only through allocate, consume and transfer");
            return Err(KernelError::Invalid(result));
        }
        self.ensure_swarm(swarm_id, ctx).await?;
        self.blackboard
            .propose(swarm_id, key, expected_version, mutation, ctx)
            .await
    }

    async fn subscribe(
        &self,
        swarm_id: SwarmId,
        filter: SubscriptionFilter,
        subscriber: Arc<dyn ContextSubscriber>,
        options: SubscribeOptions,
        ctx: &CallContext,
    ) -> Result<SubscriptionHandle, KernelError> {
        self.ensure_swarm(swarm_id, ctx).await?;
        let handle = self
            .subscriptions
            .register(swarm_id, filter, subscriber, options.replay_snapshot)?;

        if options.replay_snapshot {
            // Registered paused first so nothing committed meanwhile is missed
            match self.blackboard.snapshot(swarm_id, ctx).await {
                Ok(items) => {
                    self.subscriptions.activate(handle.id, items);
                }
                Err(e) => {
                    self.subscriptions.unsubscribe(handle.id);
                    return Err(e);
                }
            }
        }
        Ok(handle)
    }

    async fn subscribe_channel(
        &self,
        swarm_id: SwarmId,
        filter: SubscriptionFilter,
        options: SubscribeOptions,
        ctx: &CallContext,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<ContextChange>), KernelError> {
        let (subscriber, receiver) = ChannelSubscriber::new(self.config.subscriptions.queue_capacity);
        let handle = self
            .subscribe(swarm_id, filter, Arc::new(subscriber), options, ctx)
            .await?;
        Ok((handle, receiver))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.subscriptions.unsubscribe(handle.id)
    }

    async fn consume_resource(
        &self,
        swarm_id: SwarmId,
        kind: ResourceKind,
        amount: u64,
        ctx: &CallContext,
    ) -> Result<(LedgerEntry, u64), KernelError> {
        self.ensure_swarm(swarm_id, ctx).await?;
        self.resources.consume(swarm_id, kind, amount, ctx).await
    }

    async fn transfer_resource(
        &self,
        swarm_id: SwarmId,
        kind: ResourceKind,
        amount: u64,
        from: Tier,
        to: Tier,
        ctx: &CallContext,
    ) -> Result<LedgerEntry, KernelError> {
        self.ensure_swarm(swarm_id, ctx).await?;
        self.resources.transfer(swarm_id, kind, amount, from, to, ctx).await
    }
}

/// What a tier gets instead of a kernel reference: one swarm, one actor, and
/// only the tier contract.
#[derive(Clone)]
pub struct TierHandle {
    kernel: SwarmKernel,
    swarm_id: SwarmId,
    ctx: CallContext,
}

impl TierHandle {
    pub fn swarm_id(&self) -> SwarmId {
        self.swarm_id
    }

    pub fn actor(&self) -> &Actor {
        &self.ctx.actor
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.ctx = self.ctx.with_timeout(timeout);
        self
    }

    /// Calls made through the returned handle are abandoned once `token` is
    /// cancelled (up to their commit point).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.ctx = self.ctx.with_cancellation(token);
        self
    }

    pub async fn request_transition(
        &self,
        event: LifecycleEvent,
        reason: Option<String>,
    ) -> Result<LifecycleTransition, KernelError> {
        self.kernel
            .request_transition(self.swarm_id, event, reason, &self.ctx)
            .await
    }

    pub async fn report_failure(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<LifecycleTransition, KernelError> {
        let error = ErrorContext::new(kind, message, self.ctx.actor.tier);
        self.kernel.report_failure(self.swarm_id, error, &self.ctx).await
    }

    pub async fn read(&self, key: &ContextKey) -> Result<BlackboardItem, KernelError> {
        self.kernel.read_context(self.swarm_id, key, &self.ctx).await
    }

    pub async fn propose(
        &self,
        key: ContextKey,
        expected_version: u64,
        mutation: ContextMutation,
    ) -> Result<BlackboardItem, KernelError> {
        self.kernel
            .propose_context(self.swarm_id, key, expected_version, mutation, &self.ctx)
            .await
    }

    pub async fn subscribe(
        &self,
        filter: SubscriptionFilter,
        subscriber: Arc<dyn ContextSubscriber>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, KernelError> {
        self.kernel
            .subscribe(self.swarm_id, filter, subscriber, options, &self.ctx)
            .await
    }

    pub async fn subscribe_channel(
        &self,
        filter: SubscriptionFilter,
        options: SubscribeOptions,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<ContextChange>), KernelError> {
        self.kernel
            .subscribe_channel(self.swarm_id, filter, options, &self.ctx)
            .await
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.kernel.unsubscribe(handle).await
    }

    pub async fn consume(&self, kind: ResourceKind, amount: u64) -> Result<(LedgerEntry, u64), KernelError> {
        self.kernel
            .consume_resource(self.swarm_id, kind, amount, &self.ctx)
            .await
    }

    pub async fn transfer(
        &self,
        kind: ResourceKind,
        amount: u64,
        from: Tier,
        to: Tier,
    ) -> Result<LedgerEntry, KernelError> {
        self.kernel
            .transfer_resource(self.swarm_id, kind, amount, from, to, &self.ctx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::swarm::AgentId;
    use crate::infrastructure::state_store::InMemoryStateStore;

    fn kernel() -> SwarmKernel {
        SwarmKernel::new(Arc::new(InMemoryStateStore::new()), KernelConfig::default())
    }

    fn coordinator(kernel: &SwarmKernel) -> CallContext {
        kernel.call_context(Actor::new("coordinator", Tier::Coordination))
    }

    #[tokio::test]
    async fn test_create_swarm_seeds_every_item() {
        let kernel = kernel();
        let ctx = coordinator(&kernel);
        let config = SwarmConfig::new("triage open issues", "claude-sonnet");
        let swarm_id = kernel
            .create_swarm(config.clone(), vec![ResourceBudget::hard(ResourceKind::Credits, 100)], &ctx)
            .await
            .unwrap();

        let swarm = kernel.swarm(swarm_id, &ctx).await.unwrap();
        assert_eq!(swarm.state, SwarmLifecycleState::Uninitialized);
        assert_eq!(swarm.config, Some(config));
        assert_eq!(swarm.execution.max_parallel, Some(4));
        assert_eq!(swarm.resources.remaining(ResourceKind::Credits), 100);
        assert_eq!(swarm.policy.map(|p| p.auto_approve), Some(false));

        let keys: Vec<String> = kernel
            .snapshot(swarm_id, &ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.key.to_string())
            .collect();
        assert_eq!(keys, ["config", "execution_state", "policy", "resources", "team"]);
    }

    #[tokio::test]
    async fn test_invalid_config_creates_nothing() {
        let kernel = kernel();
        let ctx = coordinator(&kernel);
        let err = kernel
            .create_swarm(SwarmConfig::new("  ", "model"), Vec::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_unknown_swarm_is_reported() {
        let kernel = kernel();
        let ctx = coordinator(&kernel);
        let missing = SwarmId::new();

        assert_eq!(kernel.state(missing, &ctx).await, Err(KernelError::SwarmNotFound(missing)));
        let err = kernel
            .propose_context(
                missing,
                ContextKey::data("plan").unwrap(),
                0,
                ContextMutation::Set(ContextValue::Data(serde_json::json!({}))),
                &ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err, KernelError::SwarmNotFound(missing));
    }

    #[tokio::test]
    async fn test_in_flight_cannot_go_negative() {
        let kernel = kernel();
        let ctx = coordinator(&kernel);
        let swarm_id = kernel
            .create_swarm(SwarmConfig::new("goal", "model"), Vec::new(), &ctx)
            .await
            .unwrap();

        assert_eq!(kernel.set_in_flight(swarm_id, 2, &ctx).await.unwrap().in_flight, 2);
        assert_eq!(kernel.set_in_flight(swarm_id, -1, &ctx).await.unwrap().in_flight, 1);
        let err = kernel.set_in_flight(swarm_id, -5, &ctx).await.unwrap_err();
        assert!(matches!(err, KernelError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_handle_acts_as_its_tier() {
        let kernel = kernel();
        let ctx = coordinator(&kernel);
        let swarm_id = kernel
            .create_swarm(
                SwarmConfig::new("goal", "model"),
                vec![ResourceBudget::hard(ResourceKind::Tokens, 500)],
                &ctx,
            )
            .await
            .unwrap();
        kernel.join_team(swarm_id, TeamMember::new(AgentId::new(), "worker"), &ctx).await.unwrap();

        let coordination = kernel.handle(swarm_id, Actor::new("coordinator", Tier::Coordination));
        coordination
            .transfer(ResourceKind::Tokens, 200, Tier::Coordination, Tier::Execution)
            .await
            .unwrap();

        let execution = kernel.handle(swarm_id, Actor::new("executor-1", Tier::Execution));
        let (entry, remaining) = execution.consume(ResourceKind::Tokens, 150).await.unwrap();
        assert_eq!(entry.tier, Tier::Execution);
        assert_eq!(remaining, 350);

        // Execution tier only has 50 left of its own balance
        let err = execution.consume(ResourceKind::Tokens, 60).await.unwrap_err();
        assert!(matches!(err, KernelError::InsufficientRemaining { remaining: 50, .. }));
        assert_eq!(kernel.state(swarm_id, &ctx).await.unwrap(), SwarmLifecycleState::Uninitialized);
    }
}
