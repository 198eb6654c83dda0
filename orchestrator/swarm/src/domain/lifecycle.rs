// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Lifecycle (BC-6)
//!
//! The concrete state machine governing one swarm instance.
//!
//! ```text
//! UNINITIALIZED --initialize--> STARTING        [config present & valid]
//! STARTING      --started-----> RUNNING         [team has >= 1 active member]
//! RUNNING       --idle--------> IDLE            [no in-flight work]
//! IDLE          --resume------> RUNNING
//! RUNNING|IDLE  --pause-------> PAUSED
//! PAUSED        --resume------> RUNNING
//! RUNNING|IDLE|PAUSED --stop--> STOPPED
//! any non-terminal --fail-----> FAILED          [error context attached]
//! STOPPED|FAILED --terminate--> TERMINATED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::context::ExecutionState;
use crate::domain::resource::ResourceKind;
use crate::domain::state_machine::{MachineInstance, StateMachine, TransitionRecord};
use crate::domain::swarm::{SwarmConfig, TeamDescriptor, Tier};
use crate::domain::validation::validate_config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwarmLifecycleState {
    Uninitialized,
    Starting,
    Running,
    Idle,
    Paused,
    Stopped,
    Failed,
    Terminated,
}

impl SwarmLifecycleState {
    pub const ALL: [SwarmLifecycleState; 8] = [
        Self::Uninitialized,
        Self::Starting,
        Self::Running,
        Self::Idle,
        Self::Paused,
        Self::Stopped,
        Self::Failed,
        Self::Terminated,
    ];

    pub const NON_TERMINAL: [SwarmLifecycleState; 5] = [
        Self::Uninitialized,
        Self::Starting,
        Self::Running,
        Self::Idle,
        Self::Paused,
    ];

    /// STOPPED, FAILED and TERMINATED. Only STOPPED/FAILED → TERMINATED leaves one.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Terminated)
    }
}

impl fmt::Display for SwarmLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Idle => "IDLE",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Initialize,
    Started,
    Idle,
    Resume,
    Pause,
    Stop,
    Fail,
    Terminate,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 8] = [
        Self::Initialize,
        Self::Started,
        Self::Idle,
        Self::Resume,
        Self::Pause,
        Self::Stop,
        Self::Fail,
        Self::Terminate,
    ];
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialize => "initialize",
            Self::Started => "started",
            Self::Idle => "idle",
            Self::Resume => "resume",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Fail => "fail",
            Self::Terminate => "terminate",
        };
        f.write_str(name)
    }
}

/// Classification of why a swarm failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ResourceExhausted,
    AgentFailure,
    ToolFailure,
    Timeout,
    Internal,
    Other(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted => f.write_str("ResourceExhausted"),
            Self::AgentFailure => f.write_str("AgentFailure"),
            Self::ToolFailure => f.write_str("ToolFailure"),
            Self::Timeout => f.write_str("Timeout"),
            Self::Internal => f.write_str("Internal"),
            Self::Other(kind) => f.write_str(kind),
        }
    }
}

/// Persisted explanation of a failure, readable from the `execution_state` item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub kind: ErrorKind,
    pub message: String,
    pub tier: Tier,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorContext {
    pub fn new(kind: ErrorKind, message: impl Into<String>, tier: Tier) -> Self {
        Self {
            kind,
            message: message.into(),
            tier,
            occurred_at: Utc::now(),
        }
    }

    pub fn resource_exhausted(resource: ResourceKind, requested: u64, remaining: u64, tier: Tier) -> Self {
        Self::new(
            ErrorKind::ResourceExhausted,
            format!("{resource} pool exhausted: requested {requested}, remaining {remaining}"),
            tier,
        )
    }
}

/// The slice of the swarm aggregate the lifecycle guards look at.
#[derive(Debug, Clone, Default)]
pub struct LifecycleContext {
    pub config: Option<SwarmConfig>,
    pub team: Option<TeamDescriptor>,
    pub execution: Option<ExecutionState>,
    /// Error context supplied with a `fail` request.
    pub error: Option<ErrorContext>,
}

pub type LifecycleMachine = StateMachine<SwarmLifecycleState, LifecycleEvent, LifecycleContext>;
pub type LifecycleRecord = MachineInstance<SwarmLifecycleState, LifecycleEvent>;
pub type LifecycleTransition = TransitionRecord<SwarmLifecycleState, LifecycleEvent>;

fn config_guard(ctx: &LifecycleContext) -> Result<(), String> {
    let config = ctx.config.as_ref().ok_or("swarm configuration is missing")?;
    let result = validate_config(config);
    if result.is_valid() {
        Ok(())
    } else {
        Err(format!("swarm configuration is invalid: {result}"))
    }
}

fn team_guard(ctx: &LifecycleContext) -> Result<(), String> {
    let active = ctx.team.as_ref().map(|t| t.counted_active()).unwrap_or(0);
    if active >= 1 {
        Ok(())
    } else {
        Err("team has no active members".to_string())
    }
}

fn idle_guard(ctx: &LifecycleContext) -> Result<(), String> {
    let in_flight = ctx.execution.as_ref().map(|e| e.in_flight).unwrap_or(0);
    if in_flight == 0 {
        Ok(())
    } else {
        Err(format!("{in_flight} work item(s) still in flight"))
    }
}

fn error_guard(ctx: &LifecycleContext) -> Result<(), String> {
    match &ctx.error {
        Some(error) if !error.message.trim().is_empty() => Ok(()),
        Some(_) => Err("error context has an empty message".to_string()),
        None => Err("fail requires an error context".to_string()),
    }
}

/// Build the swarm lifecycle machine.
pub fn lifecycle_machine() -> LifecycleMachine {
    use LifecycleEvent as Ev;
    use SwarmLifecycleState as St;

    StateMachine::builder(St::Uninitialized)
        .guarded(St::Uninitialized, Ev::Initialize, St::Starting, config_guard)
        .guarded(St::Starting, Ev::Started, St::Running, team_guard)
        .guarded(St::Running, Ev::Idle, St::Idle, idle_guard)
        .transition(St::Idle, Ev::Resume, St::Running)
        .transition_from(&[St::Running, St::Idle], Ev::Pause, St::Paused)
        .transition(St::Paused, Ev::Resume, St::Running)
        .transition_from(&[St::Running, St::Idle, St::Paused], Ev::Stop, St::Stopped)
        .guarded_from(&St::NON_TERMINAL, Ev::Fail, St::Failed, error_guard)
        .transition_from(&[St::Stopped, St::Failed], Ev::Terminate, St::Terminated)
        .build()
}
