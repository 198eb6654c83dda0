// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Resource Ledger (BC-6)
//!
//! Budgets for credits, tokens and wall-clock time. Each [`ResourcePool`]
//! holds swarm-wide totals split into per-tier balances; every change is
//! recorded as an immutable [`LedgerEntry`].
//!
//! All operations are pure: they take `&self` and return the next ledger plus
//! the entry that was appended, leaving the input untouched. The
//! application layer commits the result through a single blackboard
//! compare-and-swap, which is what makes a transfer atomic.
//!
//! # Invariants
//!
//! - `consumed <= allocated` for every pool and every tier balance.
//! - Σ tier `allocated` = pool `allocated`; Σ tier `consumed` = pool `consumed`.
//! - `allocated − Σ consume entries = remaining` for every kind.
//! - Arithmetic never wraps; overflow is an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::swarm::{Actor, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Credits,
    Tokens,
    /// Wall-clock time in milliseconds.
    TimeMs,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [Self::Credits, Self::Tokens, Self::TimeMs];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credits => f.write_str("credits"),
            Self::Tokens => f.write_str("tokens"),
            Self::TimeMs => f.write_str("time_ms"),
        }
    }
}

/// Whether running out of a pool fails the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitMode {
    #[default]
    Hard,
    Soft,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBalance {
    pub allocated: u64,
    pub consumed: u64,
}

impl TierBalance {
    pub fn remaining(&self) -> u64 {
        self.allocated.saturating_sub(self.consumed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub kind: ResourceKind,
    #[serde(default)]
    pub limit: LimitMode,
    pub allocated: u64,
    pub consumed: u64,
    #[serde(default)]
    pub tiers: BTreeMap<Tier, TierBalance>,
}

impl ResourcePool {
    pub fn new(kind: ResourceKind, limit: LimitMode) -> Self {
        Self {
            kind,
            limit,
            allocated: 0,
            consumed: 0,
            tiers: BTreeMap::new(),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.allocated.saturating_sub(self.consumed)
    }

    pub fn tier(&self, tier: Tier) -> TierBalance {
        self.tiers.get(&tier).copied().unwrap_or_default()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOperation {
    Allocate,
    Consume,
    Transfer { from: Tier, to: Tier },
}

/// Immutable record of one allocation, consumption or transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Position in the ledger, starting at 1. Monotonically increasing.
    pub sequence: u64,
    pub kind: ResourceKind,
    pub amount: u64,
    #[serde(flatten)]
    pub operation: LedgerOperation,
    /// Tier the entry is attributed to (the consuming/receiving tier).
    pub tier: Tier,
    pub actor: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("no {0} pool has been allocated")]
    UnknownPool(ResourceKind),

    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("cannot transfer {0} to the same tier")]
    SameTier(Tier),

    #[error("{kind} arithmetic overflow")]
    Overflow { kind: ResourceKind },

    #[error("insufficient {kind} for {tier} tier: requested {requested}, remaining {remaining}")]
    InsufficientRemaining {
        kind: ResourceKind,
        tier: Tier,
        requested: u64,
        /// What the tier had left.
        remaining: u64,
        /// What the swarm-wide pool had left.
        pool_remaining: u64,
        limit: LimitMode,
    },

    #[error("ledger does not reconcile for {kind}: {detail}")]
    Unreconciled { kind: ResourceKind, detail: String },
}

impl ResourceError {
    /// True when a hard pool has nothing left at all. An over-sized request
    /// against a pool that still holds budget is only a rejection, and a
    /// tier-only shortage can be fixed with a transfer.
    pub fn is_hard_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::InsufficientRemaining {
                pool_remaining: 0,
                limit: LimitMode::Hard,
                ..
            }
        )
    }
}

/// Pools plus the append-only ledger. Stored as the `resources` blackboard item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLedger {
    #[serde(default)]
    pub pools: BTreeMap<ResourceKind, ResourcePool>,
    #[serde(default)]
    pub entries: Vec<LedgerEntry>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(&self, kind: ResourceKind) -> Option<&ResourcePool> {
        self.pools.get(&kind)
    }

    pub fn remaining(&self, kind: ResourceKind) -> u64 {
        self.pool(kind).map(ResourcePool::remaining).unwrap_or(0)
    }

    /// Sum of `Consume` entries for `kind`.
    pub fn consumed_by_ledger(&self, kind: ResourceKind) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind == kind && e.operation == LedgerOperation::Consume)
            .fold(0u64, |total, e| total.saturating_add(e.amount))
    }

    /// Add budget to `tier`'s balance, creating the pool on first allocation.
    /// `limit` only takes effect when the pool is created.
    pub fn allocate(
        &self,
        kind: ResourceKind,
        amount: u64,
        tier: Tier,
        limit: LimitMode,
        actor: &Actor,
    ) -> Result<(Self, LedgerEntry), ResourceError> {
        if amount == 0 {
            return Err(ResourceError::ZeroAmount);
        }
        let mut next = self.clone();
        let pool = next
            .pools
            .entry(kind)
            .or_insert_with(|| ResourcePool::new(kind, limit));

        pool.allocated = pool
            .allocated
            .checked_add(amount)
            .ok_or(ResourceError::Overflow { kind })?;
        let balance = pool.tiers.entry(tier).or_default();
        balance.allocated = balance
            .allocated
            .checked_add(amount)
            .ok_or(ResourceError::Overflow { kind })?;

        let entry = next.append(kind, amount, LedgerOperation::Allocate, tier, actor);
        Ok((next, entry))
    }

    /// Debit `amount` from the actor's tier balance. Rejected outright when it
    /// would drive any balance negative.
    pub fn consume(&self, kind: ResourceKind, amount: u64, actor: &Actor) -> Result<(Self, LedgerEntry), ResourceError> {
        if amount == 0 {
            return Err(ResourceError::ZeroAmount);
        }
        let tier = actor.tier;
        let mut next = self.clone();
        let pool = next.pools.get_mut(&kind).ok_or(ResourceError::UnknownPool(kind))?;
        let balance = pool.tier(tier);

        if balance.remaining() < amount || pool.remaining() < amount {
            return Err(ResourceError::InsufficientRemaining {
                kind,
                tier,
                requested: amount,
                remaining: balance.remaining(),
                pool_remaining: pool.remaining(),
                limit: pool.limit,
            });
        }

        pool.consumed += amount;
        pool.tiers.entry(tier).or_default().consumed += amount;

        let entry = next.append(kind, amount, LedgerOperation::Consume, tier, actor);
        Ok((next, entry))
    }

    /// Move unspent allocation from one tier balance to another. Pool totals
    /// are unchanged.
    pub fn transfer(
        &self,
        kind: ResourceKind,
        amount: u64,
        from: Tier,
        to: Tier,
        actor: &Actor,
    ) -> Result<(Self, LedgerEntry), ResourceError> {
        if amount == 0 {
            return Err(ResourceError::ZeroAmount);
        }
        if from == to {
            return Err(ResourceError::SameTier(from));
        }
        let mut next = self.clone();
        let pool = next.pools.get_mut(&kind).ok_or(ResourceError::UnknownPool(kind))?;
        let source = pool.tier(from);

        if source.remaining() < amount {
            return Err(ResourceError::InsufficientRemaining {
                kind,
                tier: from,
                requested: amount,
                remaining: source.remaining(),
                pool_remaining: pool.remaining(),
                limit: pool.limit,
            });
        }

        let destination = pool.tiers.entry(to).or_default();
        destination.allocated = destination
            .allocated
            .checked_add(amount)
            .ok_or(ResourceError::Overflow { kind })?;
        pool.tiers.entry(from).or_default().allocated -= amount;

        let entry = next.append(kind, amount, LedgerOperation::Transfer { from, to }, to, actor);
        Ok((next, entry))
    }

    /// Check that pools agree with the ledger and with their tier balances.
    /// Works on untrusted payloads: arithmetic is checked, never wrapped.
    pub fn reconcile(&self) -> Result<(), ResourceError> {
        for (kind, pool) in &self.pools {
            let kind = *kind;
            let overflow = || ResourceError::Overflow { kind };
            let mut allocated = 0u64;
            let mut consumed = 0u64;
            let mut tiers: BTreeMap<Tier, TierBalance> = BTreeMap::new();

            for entry in self.entries.iter().filter(|e| e.kind == kind) {
                match entry.operation {
                    LedgerOperation::Allocate => {
                        allocated = allocated.checked_add(entry.amount).ok_or_else(overflow)?;
                        let balance = tiers.entry(entry.tier).or_default();
                        balance.allocated = balance.allocated.checked_add(entry.amount).ok_or_else(overflow)?;
                    }
                    LedgerOperation::Consume => {
                        consumed = consumed.checked_add(entry.amount).ok_or_else(overflow)?;
                        let balance = tiers.entry(entry.tier).or_default();
                        balance.consumed = balance.consumed.checked_add(entry.amount).ok_or_else(overflow)?;
                    }
                    LedgerOperation::Transfer { from, to } => {
                        let source = tiers.entry(from).or_default();
                        source.allocated =
                            source
                                .allocated
                                .checked_sub(entry.amount)
                                .ok_or_else(|| ResourceError::Unreconciled {
                                    kind,
                                    detail: format!("entry {} moves more than the {from} tier holds", entry.sequence),
                                })?;
                        let destination = tiers.entry(to).or_default();
                        destination.allocated = destination.allocated.checked_add(entry.amount).ok_or_else(overflow)?;
                    }
                }
            }

            if allocated != pool.allocated || consumed != pool.consumed {
                return Err(ResourceError::Unreconciled {
                    kind,
                    detail: format!(
                        "pool says {}/{} allocated/consumed, ledger says {allocated}/{consumed}",
                        pool.allocated, pool.consumed
                    ),
                });
            }
            if allocated.checked_sub(consumed) != Some(pool.remaining()) {
                return Err(ResourceError::Unreconciled {
                    kind,
                    detail: "allocated minus ledger consumption differs from remaining".to_string(),
                });
            }
            for tier in Tier::ALL {
                let expected = tiers.get(&tier).copied().unwrap_or_default();
                if expected != pool.tier(tier) {
                    return Err(ResourceError::Unreconciled {
                        kind,
                        detail: format!("{tier} tier balance disagrees with ledger"),
                    });
                }
            }
        }
        Ok(())
    }

    fn append(
        &mut self,
        kind: ResourceKind,
        amount: u64,
        operation: LedgerOperation,
        tier: Tier,
        actor: &Actor,
    ) -> LedgerEntry {
        let entry = LedgerEntry {
            sequence: self.entries.last().map(|e| e.sequence.saturating_add(1)).unwrap_or(1),
            kind,
            amount,
            operation,
            tier,
            actor: actor.id.clone(),
            recorded_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Actor {
        Actor::new("coordinator", Tier::Coordination)
    }

    fn funded(kind: ResourceKind, amount: u64, limit: LimitMode) -> ResourceLedger {
        ResourceLedger::new()
            .allocate(kind, amount, Tier::Coordination, limit, &coordinator())
            .unwrap()
            .0
    }

    #[test]
    fn test_consume_debits_pool_and_tier() {
        let ledger = funded(ResourceKind::Credits, 1000, LimitMode::Hard);
        let (next, entry) = ledger.consume(ResourceKind::Credits, 200, &coordinator()).unwrap();

        assert_eq!(next.remaining(ResourceKind::Credits), 800);
        assert_eq!(next.pool(ResourceKind::Credits).unwrap().tier(Tier::Coordination).consumed, 200);
        assert_eq!(entry.sequence, 2);
        assert_eq!(entry.operation, LedgerOperation::Consume);
        // The input ledger is untouched
        assert_eq!(ledger.remaining(ResourceKind::Credits), 1000);
        next.reconcile().unwrap();
    }

    #[test]
    fn test_consume_never_goes_negative() {
        let ledger = funded(ResourceKind::Tokens, 50, LimitMode::Hard);
        let (drained, _) = ledger.consume(ResourceKind::Tokens, 50, &coordinator()).unwrap();
        assert_eq!(drained.remaining(ResourceKind::Tokens), 0);

        let err = drained.consume(ResourceKind::Tokens, 1, &coordinator()).unwrap_err();
        assert!(err.is_hard_exhaustion());
        assert!(matches!(err, ResourceError::InsufficientRemaining { remaining: 0, requested: 1, .. }));
    }

    #[test]
    fn test_soft_pool_rejects_without_hard_exhaustion() {
        let ledger = funded(ResourceKind::TimeMs, 10, LimitMode::Soft);
        let err = ledger.consume(ResourceKind::TimeMs, 11, &coordinator()).unwrap_err();
        assert!(!err.is_hard_exhaustion());
    }

    #[test]
    fn test_oversized_request_with_budget_left_is_not_exhaustion() {
        let ledger = funded(ResourceKind::Credits, 100, LimitMode::Hard);
        let err = ledger.consume(ResourceKind::Credits, 150, &coordinator()).unwrap_err();
        assert!(matches!(err, ResourceError::InsufficientRemaining { requested: 150, pool_remaining: 100, .. }));
        assert!(!err.is_hard_exhaustion());
    }

    #[test]
    fn test_tier_shortage_is_not_pool_exhaustion() {
        let ledger = funded(ResourceKind::Credits, 100, LimitMode::Hard);
        let worker = Actor::new("worker", Tier::Execution);
        let err = ledger.consume(ResourceKind::Credits, 10, &worker).unwrap_err();
        assert!(matches!(err, ResourceError::InsufficientRemaining { tier: Tier::Execution, pool_remaining: 100, .. }));
        assert!(!err.is_hard_exhaustion());
    }

    #[test]
    fn test_transfer_moves_allocation_between_tiers() {
        let ledger = funded(ResourceKind::Credits, 100, LimitMode::Hard);
        let (next, entry) = ledger
            .transfer(ResourceKind::Credits, 40, Tier::Coordination, Tier::Execution, &coordinator())
            .unwrap();

        let pool = next.pool(ResourceKind::Credits).unwrap();
        assert_eq!(pool.allocated, 100);
        assert_eq!(pool.tier(Tier::Coordination).allocated, 60);
        assert_eq!(pool.tier(Tier::Execution).allocated, 40);
        assert_eq!(entry.tier, Tier::Execution);
        next.reconcile().unwrap();

        let worker = Actor::new("worker", Tier::Execution);
        let (spent, _) = next.consume(ResourceKind::Credits, 40, &worker).unwrap();
        assert!(spent.transfer(ResourceKind::Credits, 1, Tier::Execution, Tier::Process, &worker).is_err());
        spent.reconcile().unwrap();
    }

    #[test]
    fn test_rejects_degenerate_requests() {
        let ledger = funded(ResourceKind::Credits, 10, LimitMode::Hard);
        assert_eq!(ledger.consume(ResourceKind::Credits, 0, &coordinator()).unwrap_err(), ResourceError::ZeroAmount);
        assert_eq!(
            ledger.consume(ResourceKind::Tokens, 1, &coordinator()).unwrap_err(),
            ResourceError::UnknownPool(ResourceKind::Tokens)
        );
        assert_eq!(
            ledger
                .transfer(ResourceKind::Credits, 1, Tier::Process, Tier::Process, &coordinator())
                .unwrap_err(),
            ResourceError::SameTier(Tier::Process)
        );
    }

    #[test]
    fn test_allocation_overflow_is_an_error() {
        let ledger = funded(ResourceKind::Tokens, u64::MAX, LimitMode::Hard);
        let err = ledger
            .allocate(ResourceKind::Tokens, 1, Tier::Coordination, LimitMode::Hard, &coordinator())
            .unwrap_err();
        assert_eq!(err, ResourceError::Overflow { kind: ResourceKind::Tokens });
    }

    #[test]
    fn test_reconcile_detects_tampering() {
        let mut ledger = funded(ResourceKind::Credits, 100, LimitMode::Hard);
        ledger.pools.get_mut(&ResourceKind::Credits).unwrap().consumed = 5;
        assert!(matches!(ledger.reconcile(), Err(ResourceError::Unreconciled { .. })));
    }

    #[test]
    fn test_reconcile_reports_overflowing_entries() {
        let mut ledger = funded(ResourceKind::Credits, 10, LimitMode::Hard);
        let actor = coordinator();
        ledger.append(ResourceKind::Credits, u64::MAX, LedgerOperation::Allocate, Tier::Coordination, &actor);
        ledger.append(ResourceKind::Credits, 6, LedgerOperation::Allocate, Tier::Coordination, &actor);
        assert_eq!(ledger.reconcile(), Err(ResourceError::Overflow { kind: ResourceKind::Credits }));
    }

    #[test]
    fn test_reconcile_rejects_transfer_beyond_source() {
        let mut ledger = funded(ResourceKind::Credits, 10, LimitMode::Hard);
        ledger.append(
            ResourceKind::Credits,
            50,
            LedgerOperation::Transfer {
                from: Tier::Process,
                to: Tier::Execution,
            },
            Tier::Execution,
            &coordinator(),
        );
        assert!(matches!(ledger.reconcile(), Err(ResourceError::Unreconciled { .. })));
    }
}
