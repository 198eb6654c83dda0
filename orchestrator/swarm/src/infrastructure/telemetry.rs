// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Tracing and Metrics
//!
//! The kernel records metrics through the `metrics` facade and never installs
//! an exporter; the host process picks one. Metric names are collected here
//! so dashboards and tests agree on them.

use anyhow::Context;

use crate::domain::kernel_config::LoggingConfig;

/// Counter, labels `event` and `outcome` (`accepted`/`rejected`).
pub const TRANSITIONS_TOTAL: &str = "aegis_swarm_transitions_total";
/// Counter, label `namespace`.
pub const CONTEXT_COMMITS_TOTAL: &str = "aegis_swarm_context_commits_total";
/// Counter, label `namespace`.
pub const CONTEXT_CONFLICTS_TOTAL: &str = "aegis_swarm_context_conflicts_total";
/// Counter, label `namespace`.
pub const VALIDATION_REJECTIONS_TOTAL: &str = "aegis_swarm_validation_rejections_total";
/// Counter, labels `kind` and `tier`; incremented by the consumed amount.
pub const RESOURCE_CONSUMED_TOTAL: &str = "aegis_swarm_resource_consumed_total";
pub const SUBSCRIBERS_EVICTED_TOTAL: &str = "aegis_swarm_subscribers_evicted_total";
/// Gauge of the deepest subscriber queue observed at enqueue time.
pub const SUBSCRIBER_QUEUE_DEPTH: &str = "aegis_swarm_subscriber_queue_depth";

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.level`. Returns `Ok(false)` when a global
/// subscriber was already installed, so tests may call it repeatedly.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<bool> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init().is_ok(),
        _ => builder.compact().try_init().is_ok(),
    };
    Ok(installed)
}
