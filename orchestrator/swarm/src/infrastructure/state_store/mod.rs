// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! State Store Implementations
//!
//! Infrastructure implementations of the [`StateStore`](crate::domain::repository::StateStore)
//! contract defined in the domain layer.
//!
//! - **InMemoryStateStore** - `RwLock<HashMap>` storage for tests and single-process use
//! - **PostgresStateStore** - `swarm_state` table, conditional writes via `sqlx`
//!
//! Both implement compare-and-swap as a single atomic step: the in-memory
//! store under one write lock, the PostgreSQL store as one conditional
//! statement whose affected-row count decides the outcome.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryStateStore;
pub use postgres::PostgresStateStore;
