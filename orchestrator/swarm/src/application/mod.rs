// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod call;
pub mod error;
pub mod blackboard;
pub mod subscription_manager;
pub mod lifecycle;
pub mod resource_flow;
pub mod tier_executor;
pub mod kernel;
pub mod store_factory;

// Re-export the tier-facing surface for convenience
pub use call::CallContext;
pub use error::KernelError;
pub use lifecycle::TransitionHook;
pub use subscription_manager::{ChannelSubscriber, ContextSubscriber, SubscriptionHandle};
pub use tier_executor::TierExecutorPort;
