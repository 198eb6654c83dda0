// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Domain Layer (BC-6)
//!
//! Pure domain types for swarm coordination. No I/O happens here; the only
//! outward-facing contract is the [`repository::StateStore`] trait.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`swarm`] | `Swarm`, `SwarmId`, `Actor`, `Tier`, `SwarmConfig`, `TeamDescriptor` |
//! | [`state_machine`] | `StateMachine`, `MachineInstance`, `TransitionRecord` |
//! | [`lifecycle`] | `SwarmLifecycleState`, `LifecycleEvent`, `ErrorContext` |
//! | [`context`] | `ContextKey`, `ContextValue`, `BlackboardItem`, `ContextMutation` |
//! | [`validation`] | `ValidationResult`, `ContextValidator`, `ValidatorRegistry` |
//! | [`resource`] | `ResourceLedger`, `ResourcePool`, `LedgerEntry` |
//! | [`subscription`] | `SubscriptionFilter`, `ContextChange` |
//! | [`events`] | `AuditEvent` |
//! | [`repository`] | `StateStore`, `VersionedValue`, `StoreError` |
//! | [`kernel_config`] | `KernelConfig` |

pub mod swarm;
pub mod state_machine;
pub mod lifecycle;
pub mod context;
pub mod validation;
pub mod resource;
pub mod subscription;
pub mod events;
pub mod repository;
pub mod kernel_config;

pub use swarm::*;
pub use lifecycle::{ErrorContext, ErrorKind, LifecycleEvent, SwarmLifecycleState};
pub use context::{BlackboardItem, ContextKey, ContextKind, ContextMutation, ContextValue};
pub use resource::{LimitMode, ResourceKind, ResourceLedger};
pub use validation::{ValidationIssue, ValidationResult};
