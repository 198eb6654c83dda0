// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `aegis-swarm`: Swarm Coordination Kernel (BC-6)
//!
//! Tracks the lifecycle of a running multi-agent **Swarm**, maintains the
//! shared, versioned blackboard every tier reads and writes, fans committed
//! changes out to subscribers, and meters credit/token/time budgets across
//! tier boundaries.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | FSM engine, lifecycle machine, context values, validators, resource ledger, `StateStore` trait |
//! | [`application`] | Application | `BlackboardService`, `SubscriptionManager`, `LifecycleService`, `ResourceFlowService`, `SwarmKernel` |
//! | [`infrastructure`] | Infrastructure | in-memory and PostgreSQL state stores, audit event bus, tracing setup |
//!
//! ## Key Concepts
//!
//! - **Lifecycle**: eight states from `UNINITIALIZED` to `TERMINATED`; every
//!   accepted transition is appended to an audit history.
//! - **Blackboard**: named items with a version counter. `propose` is the only
//!   write path and is a compare-and-swap on the expected version.
//! - **Resource flow**: pools per resource kind, split into per-tier balances,
//!   with an append-only consumption ledger.
//!
//! The kernel never chooses its own persistence backend: the host process
//! builds a [`domain::repository::StateStore`] once at startup and hands it to
//! [`application::kernel::SwarmKernel`].

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
pub use application::kernel::{KernelBuilder, ResourceBudget, SwarmKernel, TierHandle};
pub use application::{
    CallContext, ChannelSubscriber, ContextSubscriber, KernelError, SubscriptionHandle, TierExecutorPort, TransitionHook,
};
