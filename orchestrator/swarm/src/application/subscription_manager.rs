// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Subscription Manager
//!
//! Fans committed blackboard changes out to registered subscribers.
//!
//! Each subscriber owns a queue and a worker task. The committing writer only
//! appends to matching queues and never waits on a subscriber, so a slow or
//! failing handler cannot stall a commit or another subscriber. Delivery is
//! at-least-once and in commit order per key; workers drop any change whose
//! version is not newer than the last one they delivered for that key.
//!
//! A queue that stays at or above capacity for longer than the grace window
//! gets its subscriber evicted: the subscription is removed, a warning is
//! logged and a `SubscriberEvicted` audit event is published.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::error::KernelError;
use crate::domain::context::{BlackboardItem, ContextKey};
use crate::domain::events::AuditEvent;
use crate::domain::kernel_config::SubscriptionConfig;
use crate::domain::subscription::{ContextChange, SubscriptionFilter, SubscriptionId};
use crate::domain::swarm::SwarmId;
use crate::infrastructure::event_bus::AuditEventBus;
use crate::infrastructure::telemetry;

/// Receives committed changes for one subscription.
#[async_trait]
pub trait ContextSubscriber: Send + Sync {
    async fn on_change(&self, change: &ContextChange) -> anyhow::Result<()>;

    /// A closed subscriber is unsubscribed instead of being called.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Forwards changes into a bounded channel. Backs `subscribe_channel`.
pub struct ChannelSubscriber {
    sender: mpsc::Sender<ContextChange>,
}

impl ChannelSubscriber {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ContextChange>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ContextSubscriber for ChannelSubscriber {
    async fn on_change(&self, change: &ContextChange) -> anyhow::Result<()> {
        self.sender
            .send(change.clone())
            .await
            .map_err(|_| anyhow::anyhow!("subscription receiver dropped"))
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub swarm_id: SwarmId,
}

#[derive(Default)]
struct QueueState {
    buf: VecDeque<Arc<ContextChange>>,
    /// When the queue was first seen full with no drain below capacity since.
    full_since: Option<Instant>,
    closed: bool,
    /// Cleared while a snapshot replay is being prepared.
    ready: bool,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

enum Enqueued {
    Queued(usize),
    Evict(usize),
    Closed,
}

impl SubscriberQueue {
    fn new(ready: bool) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready,
                ..QueueState::default()
            }),
            wake: Notify::new(),
        }
    }

    fn push(&self, change: Arc<ContextChange>, capacity: usize, grace: Duration) -> Enqueued {
        let mut state = self.state.lock();
        if state.closed {
            return Enqueued::Closed;
        }
        if state.buf.len() >= capacity {
            let since = *state.full_since.get_or_insert_with(Instant::now);
            if since.elapsed() > grace {
                let queued = state.buf.len();
                state.closed = true;
                state.buf.clear();
                return Enqueued::Evict(queued);
            }
        }
        state.buf.push_back(change);
        let depth = state.buf.len();
        drop(state);
        self.wake.notify_one();
        Enqueued::Queued(depth)
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.wake.notify_one();
    }
}

struct Subscription {
    swarm_id: SwarmId,
    filter: SubscriptionFilter,
    queue: Arc<SubscriberQueue>,
}

pub struct SubscriptionManager {
    subscriptions: Arc<DashMap<SubscriptionId, Subscription>>,
    capacity: usize,
    grace_window: Duration,
    audit: AuditEventBus,
    shutdown: CancellationToken,
}

impl SubscriptionManager {
    pub fn new(config: &SubscriptionConfig, audit: AuditEventBus) -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            capacity: config.queue_capacity.max(1),
            grace_window: config.grace_window,
            audit,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a subscriber and start its worker.
    ///
    /// With `paused` set, changes queue up but nothing is delivered until
    /// [`activate`](Self::activate) supplies the replay snapshot.
    pub fn register(
        &self,
        swarm_id: SwarmId,
        filter: SubscriptionFilter,
        subscriber: Arc<dyn ContextSubscriber>,
        paused: bool,
    ) -> Result<SubscriptionHandle, KernelError> {
        filter.validate().map_err(KernelError::MalformedFilter)?;

        let id = SubscriptionId::new();
        let queue = Arc::new(SubscriberQueue::new(!paused));
        self.subscriptions.insert(
            id,
            Subscription {
                swarm_id,
                filter,
                queue: queue.clone(),
            },
        );

        let worker = Worker {
            id,
            queue,
            subscriber,
            capacity: self.capacity,
            subscriptions: self.subscriptions.clone(),
            shutdown: self.shutdown.child_token(),
        };
        tokio::spawn(worker.run());

        debug!(swarm_id = %swarm_id, subscription_id = %id, paused, "Subscriber registered");
        Ok(SubscriptionHandle { id, swarm_id })
    }

    /// Queue the matching snapshot items ahead of any live change and start
    /// delivery. Returns `false` if the subscription no longer exists.
    pub fn activate(&self, id: SubscriptionId, snapshot: Vec<BlackboardItem>) -> bool {
        let Some(entry) = self.subscriptions.get(&id) else {
            return false;
        };
        let matching: Vec<Arc<ContextChange>> = snapshot
            .into_iter()
            .map(|item| ContextChange::snapshot(entry.swarm_id, item))
            .filter(|change| entry.filter.matches(change))
            .map(Arc::new)
            .collect();

        let mut state = entry.queue.state.lock();
        for change in matching.into_iter().rev() {
            state.buf.push_front(change);
        }
        state.ready = true;
        drop(state);
        entry.queue.wake.notify_one();
        true
    }

    /// Remove a subscription. Changes still queued for it are dropped.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.remove(&id) {
            Some((_, subscription)) => {
                subscription.queue.close();
                debug!(swarm_id = %subscription.swarm_id, subscription_id = %id, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn swarm_subscriber_count(&self, swarm_id: SwarmId) -> usize {
        self.subscriptions.iter().filter(|s| s.swarm_id == swarm_id).count()
    }

    /// Queue `change` for every matching subscriber of its swarm. Never waits
    /// on a subscriber.
    pub fn notify(&self, change: &ContextChange) {
        let change = Arc::new(change.clone());
        let mut evicted = Vec::new();
        let mut deepest = 0usize;

        for entry in self.subscriptions.iter() {
            if entry.swarm_id != change.swarm_id || !entry.filter.matches(&change) {
                continue;
            }
            match entry.queue.push(change.clone(), self.capacity, self.grace_window) {
                Enqueued::Queued(depth) => deepest = deepest.max(depth),
                Enqueued::Evict(queued) => evicted.push((*entry.key(), queued)),
                Enqueued::Closed => {}
            }
        }
        metrics::gauge!(telemetry::SUBSCRIBER_QUEUE_DEPTH).set(deepest as f64);

        // Removal happens after iteration; DashMap shards are still locked inside it
        for (id, queued) in evicted {
            self.evict(id, change.swarm_id, queued);
        }
    }

    fn evict(&self, id: SubscriptionId, swarm_id: SwarmId, queued: usize) {
        self.subscriptions.remove(&id);
        warn!(
            swarm_id = %swarm_id,
            subscription_id = %id,
            queued,
            grace_window_ms = self.grace_window.as_millis() as u64,
            "Evicting subscriber whose queue stayed full past the grace window"
        );
        metrics::counter!(telemetry::SUBSCRIBERS_EVICTED_TOTAL).increment(1);
        self.audit.publish(AuditEvent::SubscriberEvicted {
            swarm_id,
            subscription_id: id,
            queued,
            evicted_at: chrono::Utc::now(),
        });
    }

    /// Stop every worker. Also happens on drop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Worker {
    id: SubscriptionId,
    queue: Arc<SubscriberQueue>,
    subscriber: Arc<dyn ContextSubscriber>,
    capacity: usize,
    subscriptions: Arc<DashMap<SubscriptionId, Subscription>>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let mut delivered: HashMap<ContextKey, u64> = HashMap::new();

        loop {
            let next = {
                let mut state = self.queue.state.lock();
                if state.closed {
                    break;
                }
                if state.ready {
                    let next = state.buf.pop_front();
                    if state.buf.len() < self.capacity {
                        state.full_since = None;
                    }
                    next
                } else {
                    None
                }
            };

            let change = match next {
                Some(change) => change,
                None => {
                    tokio::select! {
                        _ = self.queue.wake.notified() => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                    continue;
                }
            };

            let last = delivered.get(&change.item.key).copied().unwrap_or(0);
            if change.version() <= last {
                continue;
            }
            delivered.insert(change.item.key.clone(), change.version());

            if self.subscriber.is_closed() {
                debug!(subscription_id = %self.id, "Subscriber closed; removing subscription");
                self.subscriptions.remove(&self.id);
                break;
            }

            match AssertUnwindSafe(self.subscriber.on_change(&change)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    subscription_id = %self.id,
                    swarm_id = %change.swarm_id,
                    key = %change.item.key,
                    version = change.version(),
                    "Subscriber handler failed: {}",
                    e
                ),
                Err(_) => warn!(
                    subscription_id = %self.id,
                    swarm_id = %change.swarm_id,
                    key = %change.item.key,
                    version = change.version(),
                    "Subscriber handler panicked"
                ),
            }
        }
    }
}
