// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Blackboard Service
//!
//! Versioned shared context for one swarm. `propose` is the only write path:
//!
//! 1. read the current item and check the caller's expected version,
//! 2. resolve the mutation (`Set` or merge `Patch`) into a full value,
//! 3. run the validator registry; errors reject, warnings ride along,
//! 4. compare-and-swap in the store, the commit point,
//! 5. queue the change for subscribers, then publish the audit event.
//!
//! Steps 4 and 5 run inside a per-key commit section so notifications for a
//! key are queued in commit order.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::application::call::CallContext;
use crate::application::error::KernelError;
use crate::application::subscription_manager::SubscriptionManager;
use crate::domain::context::{merge_patch, BlackboardItem, ContextKey, ContextMutation, ContextValue};
use crate::domain::events::AuditEvent;
use crate::domain::repository::{StateStore, StoreError, VersionedValue};
use crate::domain::subscription::{ChangeKind, ContextChange};
use crate::domain::swarm::{Actor, SwarmId};
use crate::domain::validation::{ValidationIssue, ValidationResult, ValidatorRegistry};
use crate::infrastructure::event_bus::AuditEventBus;
use crate::infrastructure::telemetry;

/// What is persisted for a blackboard item; the version lives in the store.
#[derive(Serialize, Deserialize)]
struct StoredItem {
    value: ContextValue,
    updated_at: DateTime<Utc>,
    updated_by: Actor,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<ValidationIssue>,
}

fn decode(key: ContextKey, stored: VersionedValue) -> Result<BlackboardItem, StoreError> {
    let item: StoredItem = serde_json::from_value(stored.value)?;
    Ok(BlackboardItem {
        key,
        value: item.value,
        version: stored.version,
        updated_at: item.updated_at,
        updated_by: item.updated_by,
        warnings: item.warnings,
    })
}

fn encode(item: &BlackboardItem) -> Result<serde_json::Value, StoreError> {
    let stored = StoredItem {
        value: item.value.clone(),
        updated_at: item.updated_at,
        updated_by: item.updated_by.clone(),
        warnings: item.warnings.clone(),
    };
    Ok(serde_json::to_value(stored)?)
}

pub struct BlackboardService {
    store: Arc<dyn StateStore>,
    validators: ValidatorRegistry,
    subscriptions: Arc<SubscriptionManager>,
    audit: AuditEventBus,
    commit_locks: DashMap<(SwarmId, ContextKey), Arc<tokio::sync::Mutex<()>>>,
}

impl BlackboardService {
    pub fn new(
        store: Arc<dyn StateStore>,
        validators: ValidatorRegistry,
        subscriptions: Arc<SubscriptionManager>,
        audit: AuditEventBus,
    ) -> Self {
        Self {
            store,
            validators,
            subscriptions,
            audit,
            commit_locks: DashMap::new(),
        }
    }

    /// Current item, or `NotFound`.
    pub async fn read(&self, swarm_id: SwarmId, key: &ContextKey, ctx: &CallContext) -> Result<BlackboardItem, KernelError> {
        self.try_read(swarm_id, key, ctx)
            .await?
            .ok_or_else(|| KernelError::NotFound(key.clone()))
    }

    pub async fn try_read(
        &self,
        swarm_id: SwarmId,
        key: &ContextKey,
        ctx: &CallContext,
    ) -> Result<Option<BlackboardItem>, KernelError> {
        ctx.ensure_active()?;
        ctx.run(self.load(swarm_id, key)).await
    }

    /// Every item of the swarm, sorted by key. Reserved kernel keys are skipped.
    pub async fn snapshot(&self, swarm_id: SwarmId, ctx: &CallContext) -> Result<Vec<BlackboardItem>, KernelError> {
        ctx.ensure_active()?;
        let entries = ctx.run(self.store.list(swarm_id)).await?;
        let mut items = Vec::with_capacity(entries.len());
        for (raw_key, stored) in entries {
            let Ok(key) = ContextKey::parse(raw_key) else {
                continue;
            };
            items.push(decode(key, stored)?);
        }
        Ok(items)
    }

    /// Commit `mutation` if the item is still at `expected_version` (0 for a
    /// new item). Returns the committed item.
    pub async fn propose(
        &self,
        swarm_id: SwarmId,
        key: ContextKey,
        expected_version: u64,
        mutation: ContextMutation,
        ctx: &CallContext,
    ) -> Result<BlackboardItem, KernelError> {
        ctx.ensure_active()?;
        let current = ctx.run(self.load(swarm_id, &key)).await?;
        let current_version = current.as_ref().map(|item| item.version).unwrap_or(0);
        if current_version != expected_version {
            return Err(self.conflict(swarm_id, key, expected_version, current_version));
        }

        let proposed = Self::resolve(&key, current.as_ref(), mutation)?;
        let validation = self
            .validators
            .validate(&key, current.as_ref().map(|item| &item.value), &proposed);
        if !validation.is_valid() {
            metrics::counter!(telemetry::VALIDATION_REJECTIONS_TOTAL, "namespace" => key.kind().to_string())
                .increment(1);
            debug!(swarm_id = %swarm_id, key = %key, errors = validation.errors.len(), "Proposal rejected by validation: {}", validation);
            return Err(KernelError::Invalid(validation));
        }

        let item = BlackboardItem {
            key,
            value: proposed,
            version: expected_version + 1,
            updated_at: Utc::now(),
            updated_by: ctx.actor.clone(),
            warnings: validation.warnings,
        };
        let encoded = encode(&item)?;

        let lock_key = (swarm_id, item.key.clone());
        let lock = self.commit_locks.entry(lock_key.clone()).or_default().clone();
        let outcome = self
            .commit(swarm_id, Arc::clone(&lock), item, current, encoded, ctx)
            .await;
        drop(lock);
        self.commit_locks
            .remove_if(&lock_key, |_, lock| Arc::strong_count(lock) == 1);
        let item = outcome?;

        metrics::counter!(telemetry::CONTEXT_COMMITS_TOTAL, "namespace" => item.key.kind().to_string()).increment(1);
        debug!(
            swarm_id = %swarm_id,
            key = %item.key,
            version = item.version,
            actor = %item.updated_by,
            warnings = item.warnings.len(),
            "Context item committed"
        );
        self.audit.publish(AuditEvent::ContextCommitted {
            swarm_id,
            key: item.key.clone(),
            kind: item.value.kind(),
            version: item.version,
            actor: item.updated_by.id.clone(),
            warnings: item.warnings.len(),
            committed_at: item.updated_at,
        });
        Ok(item)
    }

    /// CAS `item` under the per-key commit lock. Subscribers are notified
    /// before the lock is released.
    async fn commit(
        &self,
        swarm_id: SwarmId,
        lock: Arc<tokio::sync::Mutex<()>>,
        item: BlackboardItem,
        previous: Option<BlackboardItem>,
        encoded: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<BlackboardItem, KernelError> {
        let expected_version = item.version - 1;
        let _guard = ctx.run(async { Ok::<_, KernelError>(lock.lock_owned().await) }).await?;
        ctx.ensure_active()?;

        // Commit point: not raced against cancellation or the timeout
        let committed = self
            .store
            .compare_and_swap(swarm_id, item.key.as_str(), expected_version, encoded)
            .await?;
        if !committed {
            let now = self
                .store
                .get(swarm_id, item.key.as_str())
                .await?
                .map(|stored| stored.version)
                .unwrap_or(0);
            return Err(self.conflict(swarm_id, item.key, expected_version, now));
        }

        let change = ContextChange {
            swarm_id,
            kind: if previous.is_some() { ChangeKind::Updated } else { ChangeKind::Created },
            item: item.clone(),
            previous,
        };
        self.subscriptions.notify(&change);
        Ok(item)
    }

    #[cfg(test)]
    fn commit_lock_count(&self) -> usize {
        self.commit_locks.len()
    }

    /// Read-modify-propose loop. `build` gets the current value (if any) and
    /// returns the replacement; on `Conflict` the loop re-reads and calls it
    /// again, up to `max_retries` extra attempts.
    pub async fn update<F>(
        &self,
        swarm_id: SwarmId,
        key: ContextKey,
        max_retries: u32,
        ctx: &CallContext,
        mut build: F,
    ) -> Result<BlackboardItem, KernelError>
    where
        F: FnMut(Option<&ContextValue>) -> Result<ContextValue, KernelError>,
    {
        let mut attempt = 0;
        loop {
            let current = self.try_read(swarm_id, &key, ctx).await?;
            let expected = current.as_ref().map(|item| item.version).unwrap_or(0);
            let next = build(current.as_ref().map(|item| &item.value))?;

            match self
                .propose(swarm_id, key.clone(), expected, ContextMutation::Set(next), ctx)
                .await
            {
                Err(KernelError::Conflict { .. }) if attempt < max_retries => {
                    attempt += 1;
                    debug!(swarm_id = %swarm_id, key = %key, attempt, "Retrying update after version conflict");
                }
                outcome => return outcome,
            }
        }
    }

    async fn load(&self, swarm_id: SwarmId, key: &ContextKey) -> Result<Option<BlackboardItem>, StoreError> {
        match self.store.get(swarm_id, key.as_str()).await {
            Ok(Some(stored)) => decode(key.clone(), stored).map(Some),
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::error!(swarm_id = %swarm_id, key = %key, "State store read failed: {}", e);
                Err(e)
            }
        }
    }

    fn resolve(
        key: &ContextKey,
        current: Option<&BlackboardItem>,
        mutation: ContextMutation,
    ) -> Result<ContextValue, KernelError> {
        match mutation {
            ContextMutation::Set(value) => Ok(value),
            ContextMutation::Patch(patch) => {
                let current = current.ok_or_else(|| KernelError::NotFound(key.clone()))?;
                let mut payload = current.value.payload().map_err(StoreError::from)?;
                merge_patch(&mut payload, &patch);
                ContextValue::from_payload(current.value.kind(), payload).map_err(|e| {
                    let mut result = ValidationResult::ok();
                    result.push_error("payload", format!("patched value has the wrong shape: {e}"));
                    KernelError::Invalid(result)
                })
            }
        }
    }

    fn conflict(&self, swarm_id: SwarmId, key: ContextKey, expected: u64, current: u64) -> KernelError {
        metrics::counter!(telemetry::CONTEXT_CONFLICTS_TOTAL, "namespace" => key.kind().to_string()).increment(1);
        debug!(swarm_id = %swarm_id, key = %key, expected, current, "Version conflict");
        KernelError::Conflict { key, expected, current }
    }
}
