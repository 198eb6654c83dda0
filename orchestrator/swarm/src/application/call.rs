// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Per-call context: who is calling, how long they are willing to wait, and
//! a token they can use to abandon the call.
//!
//! The timeout applies to each blocking phase of an operation (lock wait,
//! store read, hooks) rather than to the operation as a whole. The final
//! compare-and-swap is the commit point and is never raced against either:
//! once a write is acknowledged it stands.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::application::error::KernelError;
use crate::domain::swarm::Actor;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct CallContext {
    pub actor: Actor,
    pub timeout: Duration,
    pub cancellation: CancellationToken,
}

impl CallContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            timeout: DEFAULT_CALL_TIMEOUT,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Same actor and timeout, with a child token: cancelling `self` cancels
    /// the child, not the other way round.
    pub fn child(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            timeout: self.timeout,
            cancellation: self.cancellation.child_token(),
        }
    }

    /// Context for work the kernel does on its own behalf while serving this
    /// call, e.g. failing a swarm after a hard pool runs out.
    pub fn as_kernel(&self) -> Self {
        Self {
            actor: Actor::kernel(),
            timeout: self.timeout,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn ensure_active(&self) -> Result<(), KernelError> {
        if self.cancellation.is_cancelled() {
            Err(KernelError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run one phase under the timeout, abandoning it on cancellation.
    pub async fn run<F, T, E>(&self, phase: F) -> Result<T, KernelError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<KernelError>,
    {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(KernelError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, phase) => match outcome {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(KernelError::Timeout),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::swarm::Tier;

    fn ctx() -> CallContext {
        CallContext::new(Actor::new("tester", Tier::Process))
    }

    #[tokio::test]
    async fn test_run_passes_results_through() {
        let value = ctx().run(async { Ok::<_, KernelError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let ctx = ctx().with_timeout(Duration::from_millis(10));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, KernelError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err, KernelError::Timeout);
    }

    #[tokio::test]
    async fn test_cancelled_parent_cancels_child() {
        let parent = ctx();
        let child = parent.child();
        parent.cancellation.cancel();

        assert_eq!(child.ensure_active(), Err(KernelError::Cancelled));
        let err = child.run(std::future::pending::<Result<(), KernelError>>()).await.unwrap_err();
        assert_eq!(err, KernelError::Cancelled);
        assert!(!parent.as_kernel().is_cancelled());
    }
}
