// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Store Factory - Application Layer
//!
//! Picks the [`StateStore`] implementation from [`StoreConfig`]. Called once
//! at process start; the kernel itself only ever receives the trait object.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;

use crate::domain::kernel_config::StoreConfig;
use crate::domain::repository::{StateStore, StoreBackend};
use crate::infrastructure::state_store::{InMemoryStateStore, PostgresStateStore};

/// Build the configured state store. For PostgreSQL this connects and makes
/// sure the `swarm_state` table exists.
pub async fn build_state_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    match config.backend()? {
        StoreBackend::InMemory => {
            info!("Using in-memory swarm state store");
            Ok(Arc::new(InMemoryStateStore::new()))
        }
        StoreBackend::PostgreSQL(pg) => {
            let pool = PgPoolOptions::new()
                .max_connections(pg.max_connections)
                .connect(&pg.connection_string)
                .await
                .context("Failed to connect to the swarm state database")?;
            let store = PostgresStateStore::new(pool);
            store
                .ensure_schema()
                .await
                .context("Failed to prepare the swarm_state table")?;
            info!(max_connections = pg.max_connections, "Using PostgreSQL swarm state store");
            Ok(Arc::new(store))
        }
    }
}
