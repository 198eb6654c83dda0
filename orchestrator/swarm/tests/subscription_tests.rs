// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Subscription delivery through the kernel: isolation, ordering, snapshot
//! replay, filters and eviction of stuck subscribers.

use aegis_swarm::domain::events::AuditEvent;
use aegis_swarm::domain::kernel_config::KernelConfig;
use aegis_swarm::domain::subscription::{ChangeKind, ContextChange, SubscribeOptions, SubscriptionFilter};
use aegis_swarm::infrastructure::state_store::InMemoryStateStore;
use aegis_swarm::{
    Actor, AgentId, CallContext, ContextKey, ContextKind, ContextMutation, ContextSubscriber, ContextValue,
    KernelError, SwarmConfig, SwarmId, SwarmKernel, TeamMember, Tier, TierExecutorPort,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn ctx() -> CallContext {
    CallContext::new(Actor::new("planner", Tier::Process))
}

async fn new_swarm(kernel: &SwarmKernel) -> SwarmId {
    kernel
        .create_swarm(SwarmConfig::new("index the wiki", "claude-sonnet"), Vec::new(), &ctx())
        .await
        .unwrap()
}

async fn write(kernel: &SwarmKernel, swarm_id: SwarmId, key: &str, expected: u64, value: serde_json::Value) -> u64 {
    kernel
        .propose_context(
            swarm_id,
            ContextKey::parse(key).unwrap(),
            expected,
            ContextMutation::Set(ContextValue::Data(value)),
            &ctx(),
        )
        .await
        .unwrap()
        .version
}

async fn next(receiver: &mut mpsc::Receiver<ContextChange>) -> ContextChange {
    tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("timed out waiting for a change")
        .expect("subscription closed")
}

struct FailingSubscriber {
    calls: Arc<AtomicUsize>,
    panic: bool,
}

#[async_trait]
impl ContextSubscriber for FailingSubscriber {
    async fn on_change(&self, _change: &ContextChange) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("subscriber bug");
        }
        anyhow::bail!("downstream unavailable")
    }
}

/// Records delivered versions and returns immediately.
struct RecordingSubscriber {
    seen: Arc<std::sync::Mutex<Vec<u64>>>,
}

#[async_trait]
impl ContextSubscriber for RecordingSubscriber {
    async fn on_change(&self, change: &ContextChange) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(change.version());
        Ok(())
    }
}

/// Never returns from its first delivery.
struct StuckSubscriber;

#[async_trait]
impl ContextSubscriber for StuckSubscriber {
    async fn on_change(&self, _change: &ContextChange) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_failing_subscribers_do_not_block_others() {
    let kernel = SwarmKernel::new(Arc::new(InMemoryStateStore::new()), KernelConfig::default());
    let swarm_id = new_swarm(&kernel).await;
    let failing_calls = Arc::new(AtomicUsize::new(0));
    let panicking_calls = Arc::new(AtomicUsize::new(0));

    for (calls, panic) in [(failing_calls.clone(), false), (panicking_calls.clone(), true)] {
        kernel
            .subscribe(
                swarm_id,
                SubscriptionFilter::prefix("data/"),
                Arc::new(FailingSubscriber { calls, panic }),
                SubscribeOptions::default(),
                &ctx(),
            )
            .await
            .unwrap();
    }
    let (_, mut receiver) = kernel
        .subscribe_channel(swarm_id, SubscriptionFilter::prefix("data/"), SubscribeOptions::default(), &ctx())
        .await
        .unwrap();

    write(&kernel, swarm_id, "data/plan", 0, json!({"step": 1})).await;
    write(&kernel, swarm_id, "data/plan", 1, json!({"step": 2})).await;

    assert_eq!(next(&mut receiver).await.version(), 1);
    assert_eq!(next(&mut receiver).await.version(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(failing_calls.load(Ordering::SeqCst), 2);
    assert_eq!(panicking_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_key_delivery_follows_commit_order() {
    let kernel = SwarmKernel::new(Arc::new(InMemoryStateStore::new()), KernelConfig::default());
    let swarm_id = new_swarm(&kernel).await;
    let (_, mut receiver) = kernel
        .subscribe_channel(swarm_id, SubscriptionFilter::key("data/counter"), SubscribeOptions::default(), &ctx())
        .await
        .unwrap();

    let writers = 4;
    let per_writer = 10;
    let mut tasks = Vec::new();
    for _ in 0..writers {
        let kernel = kernel.clone();
        tasks.push(tokio::spawn(async move {
            let key = ContextKey::data("counter").unwrap();
            let mut done = 0;
            while done < per_writer {
                let expected = match kernel.read_context(swarm_id, &key, &ctx()).await {
                    Ok(item) => item.version,
                    Err(KernelError::NotFound(_)) => 0,
                    Err(e) => panic!("read failed: {e}"),
                };
                let mutation = ContextMutation::Set(ContextValue::Data(json!({ "n": expected + 1 })));
                match kernel.propose_context(swarm_id, key.clone(), expected, mutation, &ctx()).await {
                    Ok(_) => done += 1,
                    Err(e) if e.is_retryable() => {}
                    Err(e) => panic!("propose failed: {e}"),
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let total = (writers * per_writer) as u64;
    let mut versions = Vec::new();
    while versions.len() < total as usize {
        versions.push(next(&mut receiver).await.version());
    }
    assert_eq!(versions, (1..=total).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_snapshot_replay_comes_first() {
    let kernel = SwarmKernel::new(Arc::new(InMemoryStateStore::new()), KernelConfig::default());
    let swarm_id = new_swarm(&kernel).await;
    write(&kernel, swarm_id, "data/plan", 0, json!({"steps": 1})).await;
    write(&kernel, swarm_id, "data/plan", 1, json!({"steps": 2})).await;
    write(&kernel, swarm_id, "data/notes", 0, json!("first")).await;

    let (_, mut receiver) = kernel
        .subscribe_channel(swarm_id, SubscriptionFilter::prefix("data/"), SubscribeOptions::with_snapshot(), &ctx())
        .await
        .unwrap();

    let first = next(&mut receiver).await;
    let second = next(&mut receiver).await;
    assert_eq!(first.kind, ChangeKind::Snapshot);
    assert_eq!(second.kind, ChangeKind::Snapshot);
    assert_eq!((first.item.key.as_str(), first.version()), ("data/notes", 1));
    assert_eq!((second.item.key.as_str(), second.version()), ("data/plan", 2));

    write(&kernel, swarm_id, "data/plan", 2, json!({"steps": 3})).await;
    let live = next(&mut receiver).await;
    assert_eq!(live.kind, ChangeKind::Updated);
    assert_eq!(live.version(), 3);
    assert_eq!(live.previous.unwrap().version, 2);
}

#[tokio::test]
async fn test_path_and_kind_filters() {
    let kernel = SwarmKernel::new(Arc::new(InMemoryStateStore::new()), KernelConfig::default());
    let swarm_id = new_swarm(&kernel).await;
    let (_, mut status_changes) = kernel
        .subscribe_channel(
            swarm_id,
            SubscriptionFilter::path("data/plan", "/status"),
            SubscribeOptions::default(),
            &ctx(),
        )
        .await
        .unwrap();
    let (_, mut team_changes) = kernel
        .subscribe_channel(
            swarm_id,
            SubscriptionFilter::Kind(ContextKind::Team),
            SubscribeOptions::default(),
            &ctx(),
        )
        .await
        .unwrap();

    write(&kernel, swarm_id, "data/plan", 0, json!({"status": "draft", "steps": 1})).await;
    write(&kernel, swarm_id, "data/plan", 1, json!({"status": "draft", "steps": 2})).await;
    write(&kernel, swarm_id, "data/plan", 2, json!({"status": "approved", "steps": 2})).await;

    assert_eq!(next(&mut status_changes).await.version(), 1);
    assert_eq!(next(&mut status_changes).await.version(), 3);

    kernel
        .join_team(swarm_id, TeamMember::new(AgentId::new(), "indexer"), &ctx())
        .await
        .unwrap();
    let change = next(&mut team_changes).await;
    assert_eq!(change.item.value.as_team().unwrap().active_members, 1);
    assert!(team_changes.try_recv().is_err());
}

#[tokio::test]
async fn test_malformed_filter_is_rejected() {
    let kernel = SwarmKernel::new(Arc::new(InMemoryStateStore::new()), KernelConfig::default());
    let swarm_id = new_swarm(&kernel).await;

    let err = kernel
        .subscribe_channel(
            swarm_id,
            SubscriptionFilter::path("data/plan", "status"),
            SubscribeOptions::default(),
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::MalformedFilter(_)));
    assert_eq!(kernel.subscriber_count(), 0);
}

#[tokio::test]
async fn test_stuck_subscriber_is_evicted_after_grace_window() {
    let mut config = KernelConfig::default();
    config.subscriptions.queue_capacity = 2;
    config.subscriptions.grace_window = Duration::from_millis(50);
    let kernel = SwarmKernel::new(Arc::new(InMemoryStateStore::new()), config);
    let swarm_id = new_swarm(&kernel).await;
    let mut audit = kernel.audit_stream_for(swarm_id);

    let stuck = kernel
        .subscribe(
            swarm_id,
            SubscriptionFilter::prefix("data/"),
            Arc::new(StuckSubscriber),
            SubscribeOptions::default(),
            &ctx(),
        )
        .await
        .unwrap();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    kernel
        .subscribe(
            swarm_id,
            SubscriptionFilter::prefix("data/"),
            Arc::new(RecordingSubscriber { seen: seen.clone() }),
            SubscribeOptions::default(),
            &ctx(),
        )
        .await
        .unwrap();

    for version in 0..5 {
        write(&kernel, swarm_id, "data/log", version, json!({ "line": version })).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Writers never wait on the stuck subscriber
    write(&kernel, swarm_id, "data/log", 5, json!({ "line": 5 })).await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(kernel.subscriber_count(), 1);
    assert!(!kernel.unsubscribe(stuck).await);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);

    let mut evicted = None;
    while let Ok(event) = audit.try_recv() {
        if let AuditEvent::SubscriberEvicted { subscription_id, .. } = event {
            evicted = Some(subscription_id);
        }
    }
    assert_eq!(evicted, Some(stuck.id));
}

#[tokio::test]
async fn test_dropping_the_receiver_ends_the_subscription() {
    let kernel = SwarmKernel::new(Arc::new(InMemoryStateStore::new()), KernelConfig::default());
    let swarm_id = new_swarm(&kernel).await;
    let (_, receiver) = kernel
        .subscribe_channel(swarm_id, SubscriptionFilter::prefix("data/"), SubscribeOptions::default(), &ctx())
        .await
        .unwrap();
    assert_eq!(kernel.subscriber_count(), 1);
    drop(receiver);

    write(&kernel, swarm_id, "data/plan", 0, json!({})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(kernel.subscriber_count(), 0);
}
