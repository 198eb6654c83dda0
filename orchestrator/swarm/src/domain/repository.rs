// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm State Persistence Interface
//!
//! The kernel keeps every piece of swarm state (blackboard items and the
//! lifecycle record) in a single versioned key/value store. The interface is
//! defined here; implementations live in `crate::infrastructure::state_store`.
//!
//! | Backend | Implementation | Use |
//! |---------|----------------|-----|
//! | `InMemory` | `InMemoryStateStore` | tests, single-process development |
//! | `PostgreSQL` | `PostgresStateStore` | shared state across orchestrator nodes |
//!
//! The backend is chosen once at process start by
//! `crate::application::store_factory` and injected into the kernel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::swarm::SwarmId;

/// Store key under which the lifecycle record is kept. Never exposed through
/// the blackboard, which rejects keys beginning with `__`.
pub const LIFECYCLE_KEY: &str = "__lifecycle";

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    InMemory,
    PostgreSQL(PostgresConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

/// A stored value and its version. The first committed version is 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub version: u64,
    pub value: Value,
}

/// Versioned key/value persistence for swarm state.
///
/// `compare_and_swap` is the only write primitive. It must be linearizable
/// per `(swarm_id, key)`: of two concurrent calls citing the same expected
/// version, at most one returns `true`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the current value of `key`, if any.
    async fn get(&self, swarm_id: SwarmId, key: &str) -> Result<Option<VersionedValue>, StoreError>;

    /// Write `value` if the stored version equals `expected_version`.
    /// `expected_version == 0` means the key must not exist yet. On success
    /// the new version is `expected_version + 1`.
    async fn compare_and_swap(
        &self,
        swarm_id: SwarmId,
        key: &str,
        expected_version: u64,
        value: Value,
    ) -> Result<bool, StoreError>;

    /// All keys of one swarm, sorted by key.
    async fn list(&self, swarm_id: SwarmId) -> Result<Vec<(String, VersionedValue)>, StoreError>;

    /// Drop every key of one swarm. Returns the number of keys removed.
    async fn delete_swarm(&self, swarm_id: SwarmId) -> Result<u64, StoreError>;
}

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
