// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Subscription Filters and Change Notifications
//!
//! A [`ContextChange`] is produced for every committed blackboard mutation.
//! Subscribers register a [`SubscriptionFilter`]; the manager in the
//! application layer evaluates it against each change and queues matches.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::context::{BlackboardItem, ContextKind, ItemMetadata};
use crate::domain::swarm::SwarmId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    /// Current state delivered at subscribe time, before any live change.
    Snapshot,
}

/// A committed change to one blackboard item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChange {
    pub swarm_id: SwarmId,
    pub kind: ChangeKind,
    pub item: BlackboardItem,
    /// Value before the commit; `None` for created items and snapshots.
    pub previous: Option<BlackboardItem>,
}

impl ContextChange {
    pub fn version(&self) -> u64 {
        self.item.version
    }

    pub fn snapshot(swarm_id: SwarmId, item: BlackboardItem) -> Self {
        Self {
            swarm_id,
            kind: ChangeKind::Snapshot,
            item,
            previous: None,
        }
    }
}

pub type MetadataPredicate = Arc<dyn Fn(&ItemMetadata) -> bool + Send + Sync>;

/// What a subscriber wants to hear about.
#[derive(Clone)]
pub enum SubscriptionFilter {
    /// Exact item key.
    Key(String),
    /// Any key starting with the prefix, e.g. `data/plan/`.
    Prefix(String),
    /// Fires when the value at a JSON pointer inside the item's payload differs
    /// between the previous and the new value.
    Path { key: String, pointer: String },
    /// Every item holding a value of this kind.
    Kind(ContextKind),
    Change(ChangeKind),
    Predicate(MetadataPredicate),
    Any(Vec<SubscriptionFilter>),
    All(Vec<SubscriptionFilter>),
}

impl fmt::Debug for SubscriptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Self::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
            Self::Path { key, pointer } => f
                .debug_struct("Path")
                .field("key", key)
                .field("pointer", pointer)
                .finish(),
            Self::Kind(kind) => f.debug_tuple("Kind").field(kind).finish(),
            Self::Change(kind) => f.debug_tuple("Change").field(kind).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
            Self::Any(filters) => f.debug_tuple("Any").field(filters).finish(),
            Self::All(filters) => f.debug_tuple("All").field(filters).finish(),
        }
    }
}

impl SubscriptionFilter {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn path(key: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self::Path {
            key: key.into(),
            pointer: pointer.into(),
        }
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&ItemMetadata) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    /// Reject filters that can never be evaluated meaningfully.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Key(key) if key.is_empty() => Err("key filter cannot be empty".to_string()),
            Self::Prefix(prefix) if prefix.is_empty() => Err("prefix filter cannot be empty".to_string()),
            Self::Path { key, .. } if key.is_empty() => Err("path filter needs a key".to_string()),
            Self::Path { pointer, .. } if !pointer.starts_with('/') => {
                Err(format!("path pointer '{pointer}' must start with '/'"))
            }
            Self::Any(filters) | Self::All(filters) if filters.is_empty() => {
                Err("composite filter needs at least one member".to_string())
            }
            Self::Any(filters) | Self::All(filters) => filters.iter().try_for_each(SubscriptionFilter::validate),
            _ => Ok(()),
        }
    }

    /// Whether `change` is of interest to this filter.
    pub fn matches(&self, change: &ContextChange) -> bool {
        let key = change.item.key.as_str();
        match self {
            Self::Key(wanted) => key == wanted,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Path { key: wanted, pointer } => {
                if key != wanted {
                    return false;
                }
                // Snapshots always carry the current value
                if change.kind == ChangeKind::Snapshot {
                    return true;
                }
                let current = change.item.value.payload().ok();
                let previous = change.previous.as_ref().and_then(|p| p.value.payload().ok());
                let now = current.as_ref().and_then(|v| v.pointer(pointer));
                let before = previous.as_ref().and_then(|v| v.pointer(pointer));
                now != before
            }
            Self::Kind(kind) => change.item.value.kind() == *kind,
            Self::Change(kind) => change.kind == *kind,
            Self::Predicate(predicate) => predicate(&change.item.metadata()),
            Self::Any(filters) => filters.iter().any(|f| f.matches(change)),
            Self::All(filters) => filters.iter().all(|f| f.matches(change)),
        }
    }
}

/// Options applied when registering a subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Deliver the current matching items as [`ChangeKind::Snapshot`] before
    /// any live change.
    pub replay_snapshot: bool,
}

impl SubscribeOptions {
    pub fn with_snapshot() -> Self {
        Self { replay_snapshot: true }
    }
}
