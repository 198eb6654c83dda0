// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lifecycle Service
//!
//! Applies lifecycle events to a swarm's persisted state machine.
//!
//! Transitions for one swarm are serialized by a per-swarm mutex; a caller
//! that cannot acquire it within its timeout gets `Busy`. Guards look at the
//! current `config`, `team` and `execution_state` items. Async
//! [`TransitionHook`]s run after the guard passes and before the record is
//! written, so a failing or slow hook leaves the swarm where it was. `Fail`
//! is the exception: its hooks are best-effort and cannot keep a swarm alive.
//!
//! The lifecycle record itself is a [`LifecycleRecord`] stored under
//! [`LIFECYCLE_KEY`] and committed with compare-and-swap like any other item.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::blackboard::BlackboardService;
use crate::application::call::CallContext;
use crate::application::error::KernelError;
use crate::domain::context::{ContextKey, ContextValue, ExecutionStatus};
use crate::domain::events::AuditEvent;
use crate::domain::lifecycle::{
    lifecycle_machine, ErrorContext, LifecycleContext, LifecycleEvent, LifecycleMachine, LifecycleRecord,
    LifecycleTransition, SwarmLifecycleState,
};
use crate::domain::repository::{StateStore, StoreError, LIFECYCLE_KEY};
use crate::domain::state_machine::TransitionRecord;
use crate::domain::swarm::SwarmId;
use crate::infrastructure::event_bus::AuditEventBus;
use crate::infrastructure::telemetry;

/// Side effects attached to lifecycle transitions, e.g. provisioning agents
/// on `STARTING` or releasing sandboxes on `TERMINATED`.
///
/// Hooks see the transition before it is committed. Returning `Err` (or
/// overrunning the caller's timeout) aborts it, except for `Fail`, where the
/// error is logged and the swarm fails anyway.
#[async_trait]
pub trait TransitionHook: Send + Sync {
    async fn on_exit(&self, _swarm_id: SwarmId, _transition: &LifecycleTransition) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_enter(&self, _swarm_id: SwarmId, _transition: &LifecycleTransition) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct LifecycleService {
    store: Arc<dyn StateStore>,
    blackboard: Arc<BlackboardService>,
    machine: LifecycleMachine,
    hooks: Vec<Arc<dyn TransitionHook>>,
    audit: AuditEventBus,
    locks: DashMap<SwarmId, Arc<tokio::sync::Mutex<()>>>,
    max_cas_retries: u32,
}

impl LifecycleService {
    pub fn new(
        store: Arc<dyn StateStore>,
        blackboard: Arc<BlackboardService>,
        hooks: Vec<Arc<dyn TransitionHook>>,
        audit: AuditEventBus,
        max_cas_retries: u32,
    ) -> Self {
        Self {
            store,
            blackboard,
            machine: lifecycle_machine(),
            hooks,
            audit,
            locks: DashMap::new(),
            max_cas_retries,
        }
    }

    /// Persist a fresh `UNINITIALIZED` record. Fails with `SwarmExists` if the
    /// swarm already has one.
    pub async fn initialize_record(&self, swarm_id: SwarmId, ctx: &CallContext) -> Result<(), KernelError> {
        ctx.ensure_active()?;
        let record = self.machine.new_instance();
        let encoded = serde_json::to_value(&record).map_err(StoreError::from)?;
        if self.store.compare_and_swap(swarm_id, LIFECYCLE_KEY, 0, encoded).await? {
            Ok(())
        } else {
            Err(KernelError::SwarmExists(swarm_id))
        }
    }

    pub async fn state(&self, swarm_id: SwarmId, ctx: &CallContext) -> Result<SwarmLifecycleState, KernelError> {
        ctx.ensure_active()?;
        let (record, _) = ctx.run(self.load_record(swarm_id)).await?;
        Ok(record.state())
    }

    /// Every accepted transition, oldest first.
    pub async fn history(&self, swarm_id: SwarmId, ctx: &CallContext) -> Result<Vec<LifecycleTransition>, KernelError> {
        ctx.ensure_active()?;
        let (record, _) = ctx.run(self.load_record(swarm_id)).await?;
        Ok(record.history().to_vec())
    }

    /// Apply `event` to the swarm. `error` is required for `Fail`.
    ///
    /// `Fail` cannot be vetoed: its error is recorded before hooks run, hook
    /// failures are only logged, and a lost compare-and-swap is retried
    /// against the reloaded record.
    pub async fn request_transition(
        &self,
        swarm_id: SwarmId,
        event: LifecycleEvent,
        reason: Option<String>,
        error: Option<ErrorContext>,
        ctx: &CallContext,
    ) -> Result<LifecycleTransition, KernelError> {
        ctx.ensure_active()?;
        let lock = self.locks.entry(swarm_id).or_default().clone();
        let outcome = match ctx
            .run(async { Ok::<_, KernelError>(Arc::clone(&lock).lock_owned().await) })
            .await
        {
            Ok(_serialized) => self.transition_serialized(swarm_id, event, reason, error, ctx).await,
            Err(KernelError::Timeout) => Err(KernelError::Busy(swarm_id)),
            Err(other) => Err(other),
        };
        drop(lock);
        self.locks.remove_if(&swarm_id, |_, lock| Arc::strong_count(lock) == 1);
        outcome
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }

    async fn transition_serialized(
        &self,
        swarm_id: SwarmId,
        event: LifecycleEvent,
        reason: Option<String>,
        error: Option<ErrorContext>,
        ctx: &CallContext,
    ) -> Result<LifecycleTransition, KernelError> {
        let failing = event == LifecycleEvent::Fail;
        let (mut record, mut version) = ctx.run(self.load_record(swarm_id)).await?;
        let from = record.state();
        if !self.machine.has_rule(from, &event) {
            return Err(self.rejected(swarm_id, KernelError::InvalidTransition { from, event }));
        }

        let guard_ctx = self.guard_context(swarm_id, error.clone(), ctx).await?;
        let to = self
            .machine
            .resolve(from, &event, &guard_ctx)
            .map_err(|e| self.rejected(swarm_id, e.into()))?;

        if let (true, Some(error)) = (failing, &error) {
            self.persist_error(swarm_id, error, ctx).await?;
        }

        let preview = TransitionRecord {
            from,
            to,
            event,
            actor: ctx.actor.to_string(),
            reason: reason.clone(),
            at: chrono::Utc::now(),
        };
        self.run_hooks(swarm_id, &preview, !failing, ctx).await?;

        let actor = ctx.actor.to_string();
        let mut attempts = 0;
        let transition = loop {
            let transition = self
                .machine
                .transition(&mut record, event, &guard_ctx, &actor, reason.clone())?;
            let encoded = serde_json::to_value(&record).map_err(StoreError::from)?;

            ctx.ensure_active()?;
            // Commit point
            if self.store.compare_and_swap(swarm_id, LIFECYCLE_KEY, version, encoded).await? {
                break transition;
            }
            if !failing || attempts >= self.max_cas_retries {
                return Err(self.rejected(swarm_id, KernelError::Busy(swarm_id)));
            }
            attempts += 1;
            debug!(swarm_id = %swarm_id, attempt = attempts, "Lifecycle record moved under a failure, retrying");
            (record, version) = ctx.run(self.load_record(swarm_id)).await?;
        };

        metrics::counter!(
            telemetry::TRANSITIONS_TOTAL,
            "event" => event.to_string(),
            "outcome" => "accepted"
        )
        .increment(1);
        info!(
            swarm_id = %swarm_id,
            from = %transition.from,
            to = %transition.to,
            event = %event,
            actor = %transition.actor,
            "Swarm lifecycle transition"
        );
        self.audit.publish(AuditEvent::LifecycleTransitioned {
            swarm_id,
            from: transition.from,
            to: transition.to,
            event,
            actor: transition.actor.clone(),
            reason: transition.reason.clone(),
            error,
            transitioned_at: transition.at,
        });
        Ok(transition)
    }

    async fn load_record(&self, swarm_id: SwarmId) -> Result<(LifecycleRecord, u64), KernelError> {
        let stored = self
            .store
            .get(swarm_id, LIFECYCLE_KEY)
            .await?
            .ok_or(KernelError::SwarmNotFound(swarm_id))?;
        let record: LifecycleRecord = serde_json::from_value(stored.value).map_err(StoreError::from)?;
        Ok((record, stored.version))
    }

    async fn guard_context(
        &self,
        swarm_id: SwarmId,
        error: Option<ErrorContext>,
        ctx: &CallContext,
    ) -> Result<LifecycleContext, KernelError> {
        let config = self.blackboard.try_read(swarm_id, &ContextKey::config(), ctx).await?;
        let team = self.blackboard.try_read(swarm_id, &ContextKey::team(), ctx).await?;
        let execution = self
            .blackboard
            .try_read(swarm_id, &ContextKey::execution_state(), ctx)
            .await?;

        Ok(LifecycleContext {
            config: config.and_then(|item| item.value.as_config().cloned()),
            team: team.and_then(|item| item.value.as_team().cloned()),
            execution: execution.and_then(|item| item.value.as_execution_state().cloned()),
            error,
        })
    }

    /// Run exit then enter hooks. With `veto` off a failing or slow hook is
    /// logged and the remaining hooks still run.
    async fn run_hooks(
        &self,
        swarm_id: SwarmId,
        preview: &LifecycleTransition,
        veto: bool,
        ctx: &CallContext,
    ) -> Result<(), KernelError> {
        for hook in &self.hooks {
            let outcome = ctx
                .run(async {
                    hook.on_exit(swarm_id, preview)
                        .await
                        .map_err(|e| KernelError::HookFailed(format!("exit hook for {}: {}", preview.from, e)))
                })
                .await;
            self.hook_outcome(swarm_id, preview, veto, outcome)?;
        }
        for hook in &self.hooks {
            let outcome = ctx
                .run(async {
                    hook.on_enter(swarm_id, preview)
                        .await
                        .map_err(|e| KernelError::HookFailed(format!("enter hook for {}: {}", preview.to, e)))
                })
                .await;
            self.hook_outcome(swarm_id, preview, veto, outcome)?;
        }
        Ok(())
    }

    fn hook_outcome(
        &self,
        swarm_id: SwarmId,
        preview: &LifecycleTransition,
        veto: bool,
        outcome: Result<(), KernelError>,
    ) -> Result<(), KernelError> {
        match outcome {
            Ok(()) => Ok(()),
            Err(e) if veto => Err(self.rejected(swarm_id, e)),
            Err(e) => {
                warn!(swarm_id = %swarm_id, to = %preview.to, "Transition hook failed, continuing: {}", e);
                Ok(())
            }
        }
    }

    /// Record the failure on `execution_state` so observers can see why the
    /// swarm stopped.
    async fn persist_error(&self, swarm_id: SwarmId, error: &ErrorContext, ctx: &CallContext) -> Result<(), KernelError> {
        self.blackboard
            .update(swarm_id, ContextKey::execution_state(), self.max_cas_retries, ctx, |current| {
                let mut state = current
                    .and_then(ContextValue::as_execution_state)
                    .cloned()
                    .unwrap_or_default();
                state.status = ExecutionStatus::Failed;
                state.error = Some(error.clone());
                Ok(ContextValue::ExecutionState(state))
            })
            .await?;
        Ok(())
    }

    fn rejected(&self, swarm_id: SwarmId, err: KernelError) -> KernelError {
        let event = match &err {
            KernelError::InvalidTransition { event, .. } | KernelError::GuardFailed { event, .. } => event.to_string(),
            _ => "unknown".to_string(),
        };
        metrics::counter!(telemetry::TRANSITIONS_TOTAL, "event" => event, "outcome" => "rejected").increment(1);
        debug!(swarm_id = %swarm_id, "Lifecycle transition rejected: {}", err);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::subscription_manager::SubscriptionManager;
    use crate::domain::kernel_config::SubscriptionConfig;
    use crate::domain::lifecycle::ErrorKind;
    use crate::domain::repository::VersionedValue;
    use crate::domain::swarm::{Actor, Tier};
    use crate::domain::validation::ValidatorRegistry;
    use crate::infrastructure::state_store::InMemoryStateStore;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Rewrites the lifecycle record once, right before the next lifecycle
    /// compare-and-swap, so that swap loses.
    struct InterferingStore {
        inner: InMemoryStateStore,
        interfere: AtomicBool,
    }

    #[async_trait]
    impl StateStore for InterferingStore {
        async fn get(&self, swarm_id: SwarmId, key: &str) -> Result<Option<VersionedValue>, StoreError> {
            self.inner.get(swarm_id, key).await
        }

        async fn compare_and_swap(
            &self,
            swarm_id: SwarmId,
            key: &str,
            expected_version: u64,
            value: Value,
        ) -> Result<bool, StoreError> {
            if key == LIFECYCLE_KEY && self.interfere.swap(false, Ordering::SeqCst) {
                if let Some(current) = self.inner.get(swarm_id, key).await? {
                    self.inner
                        .compare_and_swap(swarm_id, key, current.version, current.value)
                        .await?;
                }
            }
            self.inner.compare_and_swap(swarm_id, key, expected_version, value).await
        }

        async fn list(&self, swarm_id: SwarmId) -> Result<Vec<(String, VersionedValue)>, StoreError> {
            self.inner.list(swarm_id).await
        }

        async fn delete_swarm(&self, swarm_id: SwarmId) -> Result<u64, StoreError> {
            self.inner.delete_swarm(swarm_id).await
        }
    }

    fn service(store: Arc<dyn StateStore>) -> LifecycleService {
        let audit = AuditEventBus::default();
        let blackboard = Arc::new(BlackboardService::new(
            store.clone(),
            ValidatorRegistry::standard(0.1),
            Arc::new(SubscriptionManager::new(&SubscriptionConfig::default(), audit.clone())),
            audit.clone(),
        ));
        LifecycleService::new(store, blackboard, Vec::new(), audit, 3)
    }

    fn ctx() -> CallContext {
        CallContext::new(Actor::kernel())
    }

    fn failure() -> ErrorContext {
        ErrorContext::new(ErrorKind::Internal, "sandbox pool unreachable", Tier::Coordination)
    }

    #[tokio::test]
    async fn test_failure_survives_a_moved_record() {
        let store = Arc::new(InterferingStore {
            inner: InMemoryStateStore::new(),
            interfere: AtomicBool::new(false),
        });
        let lifecycle = service(store.clone());
        let swarm = SwarmId::new();
        lifecycle.initialize_record(swarm, &ctx()).await.unwrap();
        store.interfere.store(true, Ordering::SeqCst);

        let transition = lifecycle
            .request_transition(swarm, LifecycleEvent::Fail, None, Some(failure()), &ctx())
            .await
            .unwrap();

        assert_eq!(transition.to, SwarmLifecycleState::Failed);
        assert!(!store.interfere.load(Ordering::SeqCst));
        assert_eq!(lifecycle.state(swarm, &ctx()).await.unwrap(), SwarmLifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_swarm_locks_are_released_after_use() {
        let lifecycle = service(Arc::new(InMemoryStateStore::new()));
        for _ in 0..10 {
            let swarm = SwarmId::new();
            lifecycle.initialize_record(swarm, &ctx()).await.unwrap();
            lifecycle
                .request_transition(swarm, LifecycleEvent::Fail, None, Some(failure()), &ctx())
                .await
                .unwrap();
            let rejected = lifecycle
                .request_transition(swarm, LifecycleEvent::Resume, None, None, &ctx())
                .await
                .unwrap_err();
            assert!(matches!(rejected, KernelError::InvalidTransition { .. }));
        }
        lifecycle
            .request_transition(SwarmId::new(), LifecycleEvent::Pause, None, None, &ctx())
            .await
            .unwrap_err();
        assert_eq!(lifecycle.lock_count(), 0);
    }
}
