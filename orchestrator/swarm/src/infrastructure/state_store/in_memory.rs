// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::domain::repository::{StateStore, StoreError, VersionedValue};
use crate::domain::swarm::SwarmId;

type SwarmEntries = BTreeMap<String, VersionedValue>;

#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    swarms: Arc<RwLock<HashMap<SwarmId, SwarmEntries>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("in-memory state store lock poisoned".to_string())
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, swarm_id: SwarmId, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        let swarms = self.swarms.read().map_err(poisoned)?;
        Ok(swarms.get(&swarm_id).and_then(|entries| entries.get(key)).cloned())
    }

    async fn compare_and_swap(
        &self,
        swarm_id: SwarmId,
        key: &str,
        expected_version: u64,
        value: Value,
    ) -> Result<bool, StoreError> {
        let mut swarms = self.swarms.write().map_err(poisoned)?;
        let entries = swarms.entry(swarm_id).or_default();
        let current = entries.get(key).map(|v| v.version).unwrap_or(0);
        if current != expected_version {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            VersionedValue {
                version: expected_version + 1,
                value,
            },
        );
        Ok(true)
    }

    async fn list(&self, swarm_id: SwarmId) -> Result<Vec<(String, VersionedValue)>, StoreError> {
        let swarms = self.swarms.read().map_err(poisoned)?;
        Ok(swarms
            .get(&swarm_id)
            .map(|entries| entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn delete_swarm(&self, swarm_id: SwarmId) -> Result<u64, StoreError> {
        let mut swarms = self.swarms.write().map_err(poisoned)?;
        Ok(swarms.remove(&swarm_id).map(|entries| entries.len() as u64).unwrap_or(0))
    }
}
