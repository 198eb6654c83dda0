// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Audit Event Bus - Pub/Sub for committed swarm state changes
//
// Broadcasts every lifecycle transition, blackboard commit and ledger entry
// to observers (dashboards, persisters, tests) over a tokio broadcast channel.
// Slow observers lag and lose events; they never slow down the kernel.

use crate::domain::events::AuditEvent;
use crate::domain::swarm::SwarmId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to audit events
#[derive(Clone)]
pub struct AuditEventBus {
    sender: Arc<broadcast::Sender<AuditEvent>>,
}

impl AuditEventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publish an audit event to all subscribers
    pub fn publish(&self, event: AuditEvent) {
        let name = event.name();
        let swarm_id = event.swarm_id();
        // send() only fails when nobody is listening
        if self.sender.send(event).is_err() {
            debug!(event = name, swarm_id = %swarm_id, "No audit subscribers listening");
        }
    }

    /// Subscribe to all audit events
    pub fn subscribe(&self) -> AuditReceiver {
        AuditReceiver {
            receiver: self.sender.subscribe(),
            swarm_id: None,
        }
    }

    /// Subscribe to the audit events of a single swarm
    pub fn subscribe_swarm(&self, swarm_id: SwarmId) -> AuditReceiver {
        AuditReceiver {
            receiver: self.sender.subscribe(),
            swarm_id: Some(swarm_id),
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for AuditEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Receiver for audit events, optionally filtered to one swarm
pub struct AuditReceiver {
    receiver: broadcast::Receiver<AuditEvent>,
    swarm_id: Option<SwarmId>,
}

impl AuditReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<AuditEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("Audit receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&mut self) -> Result<AuditEvent, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(|e| match e {
                broadcast::error::TryRecvError::Empty => EventBusError::Empty,
                broadcast::error::TryRecvError::Closed => EventBusError::Closed,
                broadcast::error::TryRecvError::Lagged(n) => {
                    warn!("Audit receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    fn accepts(&self, event: &AuditEvent) -> bool {
        self.swarm_id.map_or(true, |id| event.swarm_id() == id)
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
