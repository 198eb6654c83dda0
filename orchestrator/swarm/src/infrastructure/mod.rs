// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Kernel Infrastructure Layer
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`state_store`] | `InMemoryStateStore`, `PostgresStateStore` |
//! | [`event_bus`] | `AuditEventBus`, `AuditReceiver` |
//! | [`telemetry`] | `init_tracing`, metric names |

pub mod event_bus;
pub mod state_store;
pub mod telemetry;
