// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL State Store
//!
//! `StateStore` backed by one `swarm_state` table:
//!
//! ```sql
//! CREATE TABLE swarm_state (
//!     swarm_id   UUID        NOT NULL,
//!     key        TEXT        NOT NULL,
//!     version    BIGINT      NOT NULL,
//!     value      JSONB       NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (swarm_id, key)
//! );
//! ```
//!
//! Compare-and-swap is a single conditional statement: `INSERT ... ON
//! CONFLICT DO NOTHING` for version 0 and `UPDATE ... WHERE version = $n`
//! otherwise. Exactly one affected row means the write won.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::repository::{StateStore, StoreError, VersionedValue};
use crate::domain::swarm::SwarmId;

pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `swarm_state` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swarm_state (
                swarm_id UUID NOT NULL,
                key TEXT NOT NULL,
                version BIGINT NOT NULL,
                value JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (swarm_id, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to create swarm_state table: {}", e)))?;
        Ok(())
    }
}

fn to_db_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Backend(format!("version {version} does not fit in BIGINT")))
}

fn from_db_version(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version).map_err(|_| StoreError::Backend(format!("negative version {version} in swarm_state")))
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn get(&self, swarm_id: SwarmId, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT version, value
            FROM swarm_state
            WHERE swarm_id = $1 AND key = $2
            "#,
        )
        .bind(swarm_id.0)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(VersionedValue {
                version: from_db_version(row.get("version"))?,
                value: row.get("value"),
            })
        })
        .transpose()
    }

    async fn compare_and_swap(
        &self,
        swarm_id: SwarmId,
        key: &str,
        expected_version: u64,
        value: Value,
    ) -> Result<bool, StoreError> {
        let next_version = to_db_version(expected_version + 1)?;

        let result = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO swarm_state (swarm_id, key, version, value, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (swarm_id, key) DO NOTHING
                "#,
            )
            .bind(swarm_id.0)
            .bind(key)
            .bind(next_version)
            .bind(value)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE swarm_state
                SET version = $3, value = $4, updated_at = NOW()
                WHERE swarm_id = $1 AND key = $2 AND version = $5
                "#,
            )
            .bind(swarm_id.0)
            .bind(key)
            .bind(next_version)
            .bind(value)
            .bind(to_db_version(expected_version)?)
            .execute(&self.pool)
            .await?
        };

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, swarm_id: SwarmId) -> Result<Vec<(String, VersionedValue)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key, version, value
            FROM swarm_state
            WHERE swarm_id = $1
            ORDER BY key
            "#,
        )
        .bind(swarm_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let key: String = row.get("key");
                Ok((
                    key,
                    VersionedValue {
                        version: from_db_version(row.get("version"))?,
                        value: row.get("value"),
                    },
                ))
            })
            .collect()
    }

    async fn delete_swarm(&self, swarm_id: SwarmId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM swarm_state WHERE swarm_id = $1")
            .bind(swarm_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
