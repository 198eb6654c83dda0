// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Domain Aggregates (BC-6)
//!
//! Defines the core types for swarm coordination:
//!
//! - [`Swarm`]: read-only aggregate view assembled from the blackboard.
//! - [`SwarmId`] / [`AgentId`]: unique identifiers (UUID newtypes).
//! - [`Tier`] / [`Actor`]: who is acting on the kernel.
//! - [`SwarmConfig`]: immutable run configuration.
//! - [`TeamDescriptor`]: agent roster and capability set.
//!
//! See AGENTS.md §Swarm Coordination Context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::domain::context::{ExecutionState, PolicyDocument};
use crate::domain::lifecycle::SwarmLifecycleState;
use crate::domain::resource::ResourceLedger;

/// Unique identifier for a [`Swarm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwarmId(pub Uuid);

impl SwarmId {
    /// Generate a new random `SwarmId`.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SwarmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an agent participating in a swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three execution layers that consume the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Tier 1: goal decomposition and team management.
    Coordination,
    /// Tier 2: routine navigation.
    Process,
    /// Tier 3: individual step execution (LLM and tool calls).
    Execution,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Coordination, Tier::Process, Tier::Execution];
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Coordination => write!(f, "coordination"),
            Tier::Process => write!(f, "process"),
            Tier::Execution => write!(f, "execution"),
        }
    }
}

/// The party invoking a kernel operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub tier: Tier,
}

impl Actor {
    pub fn new(id: impl Into<String>, tier: Tier) -> Self {
        Self { id: id.into(), tier }
    }

    /// Actor used for transitions the kernel triggers on its own behalf
    /// (e.g. resource exhaustion).
    pub fn kernel() -> Self {
        Self::new("swarm-kernel", Tier::Coordination)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tier, self.id)
    }
}

/// Immutable configuration captured when the coordination request is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Natural-language goal the swarm works towards.
    pub goal: String,
    /// Model identifier used by the coordination tier.
    pub model: String,
    /// Sampling temperature, `0.0..=2.0`.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Whether tool calls may run without human approval.
    #[serde(default)]
    pub auto_approve: bool,
    /// Maximum number of concurrently executing steps.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
}

impl SwarmConfig {
    pub fn new(goal: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            model: model.into(),
            temperature: default_temperature(),
            auto_approve: false,
            max_parallel: default_max_parallel(),
        }
    }
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_parallel() -> u32 {
    4
}

/// One agent on the swarm's roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub agent_id: AgentId,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub active: bool,
    pub joined_at: DateTime<Utc>,
}

impl TeamMember {
    pub fn new(agent_id: AgentId, role: impl Into<String>) -> Self {
        Self {
            agent_id,
            role: role.into(),
            capabilities: Vec::new(),
            active: true,
            joined_at: Utc::now(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Agent roster, capability set and active-member count.
///
/// # Invariants
///
/// - Agent ids on the roster are unique.
/// - `active_members` equals the number of roster entries with `active == true`.
/// - `capabilities` is the union of every member's capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamDescriptor {
    #[serde(default)]
    pub members: Vec<TeamMember>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub active_members: u32,
}

impl TeamDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a member, keeping the derived fields consistent.
    pub fn upsert_member(&mut self, member: TeamMember) {
        match self.members.iter_mut().find(|m| m.agent_id == member.agent_id) {
            Some(existing) => *existing = member,
            None => self.members.push(member),
        }
        self.recompute();
    }

    /// Mark a member inactive. Returns `false` if the agent is not on the roster.
    pub fn deactivate(&mut self, agent_id: AgentId) -> bool {
        let found = match self.members.iter_mut().find(|m| m.agent_id == agent_id) {
            Some(member) => {
                member.active = false;
                true
            }
            None => false,
        };
        self.recompute();
        found
    }

    pub fn member(&self, agent_id: AgentId) -> Option<&TeamMember> {
        self.members.iter().find(|m| m.agent_id == agent_id)
    }

    pub fn counted_active(&self) -> u32 {
        self.members.iter().filter(|m| m.active).count() as u32
    }

    fn recompute(&mut self) {
        self.active_members = self.counted_active();
        self.capabilities = self
            .members
            .iter()
            .flat_map(|m| m.capabilities.iter().cloned())
            .collect();
    }
}

/// Read-only aggregate view of one swarm, assembled from its blackboard items
/// and lifecycle record. Mutations never go through this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swarm {
    pub id: SwarmId,
    pub state: SwarmLifecycleState,
    pub config: Option<SwarmConfig>,
    pub team: TeamDescriptor,
    pub resources: ResourceLedger,
    pub policy: Option<PolicyDocument>,
    pub execution: ExecutionState,
}

impl Swarm {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
