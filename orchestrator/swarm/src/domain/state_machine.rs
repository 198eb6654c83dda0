// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Finite State Machine Engine
//!
//! A generic, table-driven state machine primitive.
//!
//! - A [`StateMachine`] is an immutable *definition*: the transition table,
//!   optional guards and enter/exit hooks. It is built once and shared.
//! - A [`MachineInstance`] is the serializable *runtime* part: the current
//!   state plus the append-only history of accepted transitions.
//!
//! `transition` is all-or-nothing: guard and hooks run against the proposed
//! transition first, and the instance is only mutated once all of them pass.
//! A failing hook therefore leaves the prior state in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Predicate evaluated against the guard context. `Err` carries the reason.
pub type Guard<C> = Box<dyn Fn(&C) -> Result<(), String> + Send + Sync>;

/// Synchronous enter/exit hook. `Err` aborts the transition.
pub type Hook<S, E, C> = Box<dyn Fn(&C, &TransitionRecord<S, E>) -> Result<(), String> + Send + Sync>;

/// One accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord<S, E> {
    pub from: S,
    pub to: S,
    pub event: E,
    pub actor: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Current state plus transition history of one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineInstance<S, E> {
    state: S,
    history: Vec<TransitionRecord<S, E>>,
}

impl<S: Copy, E> MachineInstance<S, E> {
    pub fn new(initial: S) -> Self {
        Self {
            state: initial,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn history(&self) -> &[TransitionRecord<S, E>] {
        &self.history
    }

    pub fn last_transition(&self) -> Option<&TransitionRecord<S, E>> {
        self.history.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Exit,
    Enter,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Exit => write!(f, "exit"),
            HookPhase::Enter => write!(f, "enter"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError<S: fmt::Debug, E: fmt::Debug> {
    #[error("no transition for event {event:?} in state {from:?}")]
    InvalidTransition { from: S, event: E },

    #[error("guard rejected {event:?} in state {from:?}: {reason}")]
    GuardFailed { from: S, event: E, reason: String },

    #[error("{phase} hook failed during {from:?} -> {to:?}: {reason}")]
    HookFailed {
        from: S,
        to: S,
        phase: HookPhase,
        reason: String,
    },
}

struct Rule<S, C> {
    to: S,
    guard: Option<Guard<C>>,
}

/// Immutable transition table with guards and hooks.
pub struct StateMachine<S, E, C> {
    initial: S,
    rules: HashMap<(S, E), Rule<S, C>>,
    on_enter: HashMap<S, Vec<Hook<S, E, C>>>,
    on_exit: HashMap<S, Vec<Hook<S, E, C>>>,
}

impl<S, E, C> fmt::Debug for StateMachine<S, E, C>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("initial", &self.initial)
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl<S, E, C> StateMachine<S, E, C>
where
    S: Copy + Eq + Hash + fmt::Debug,
    E: Clone + Eq + Hash + fmt::Debug,
{
    pub fn builder(initial: S) -> StateMachineBuilder<S, E, C> {
        StateMachineBuilder {
            initial,
            rules: HashMap::new(),
            on_enter: HashMap::new(),
            on_exit: HashMap::new(),
        }
    }

    pub fn initial(&self) -> S {
        self.initial
    }

    pub fn new_instance(&self) -> MachineInstance<S, E> {
        MachineInstance::new(self.initial)
    }

    /// Whether the table has a rule for `(from, event)`, ignoring guards.
    pub fn has_rule(&self, from: S, event: &E) -> bool {
        self.rules.contains_key(&(from, event.clone()))
    }

    /// Look up the target state and evaluate the guard, without side effects.
    pub fn resolve(&self, from: S, event: &E, ctx: &C) -> Result<S, TransitionError<S, E>> {
        let rule = self
            .rules
            .get(&(from, event.clone()))
            .ok_or_else(|| TransitionError::InvalidTransition {
                from,
                event: event.clone(),
            })?;

        if let Some(guard) = &rule.guard {
            guard(ctx).map_err(|reason| TransitionError::GuardFailed {
                from,
                event: event.clone(),
                reason,
            })?;
        }

        Ok(rule.to)
    }

    /// Apply `event` to `instance`. On any error the instance is untouched.
    pub fn transition(
        &self,
        instance: &mut MachineInstance<S, E>,
        event: E,
        ctx: &C,
        actor: &str,
        reason: Option<String>,
    ) -> Result<TransitionRecord<S, E>, TransitionError<S, E>> {
        let from = instance.state;
        let to = self.resolve(from, &event, ctx)?;

        let record = TransitionRecord {
            from,
            to,
            event,
            actor: actor.to_string(),
            reason,
            at: Utc::now(),
        };

        self.run_hooks(&self.on_exit, from, HookPhase::Exit, ctx, &record)?;
        self.run_hooks(&self.on_enter, to, HookPhase::Enter, ctx, &record)?;

        instance.state = to;
        instance.history.push(record.clone());
        Ok(record)
    }

    fn run_hooks(
        &self,
        hooks: &HashMap<S, Vec<Hook<S, E, C>>>,
        state: S,
        phase: HookPhase,
        ctx: &C,
        record: &TransitionRecord<S, E>,
    ) -> Result<(), TransitionError<S, E>> {
        for hook in hooks.get(&state).into_iter().flatten() {
            hook(ctx, record).map_err(|reason| TransitionError::HookFailed {
                from: record.from,
                to: record.to,
                phase,
                reason,
            })?;
        }
        Ok(())
    }
}

pub struct StateMachineBuilder<S, E, C> {
    initial: S,
    rules: HashMap<(S, E), Rule<S, C>>,
    on_enter: HashMap<S, Vec<Hook<S, E, C>>>,
    on_exit: HashMap<S, Vec<Hook<S, E, C>>>,
}

impl<S, E, C> StateMachineBuilder<S, E, C>
where
    S: Copy + Eq + Hash + fmt::Debug,
    E: Clone + Eq + Hash + fmt::Debug,
{
    /// Unguarded rule `from --event--> to`.
    pub fn transition(mut self, from: S, event: E, to: S) -> Self {
        self.rules.insert((from, event), Rule { to, guard: None });
        self
    }

    /// Unguarded rule from each state in `from`.
    pub fn transition_from(mut self, from: &[S], event: E, to: S) -> Self {
        for state in from {
            self = self.transition(*state, event.clone(), to);
        }
        self
    }

    pub fn guarded<G>(mut self, from: S, event: E, to: S, guard: G) -> Self
    where
        G: Fn(&C) -> Result<(), String> + Send + Sync + 'static,
    {
        self.rules.insert(
            (from, event),
            Rule {
                to,
                guard: Some(Box::new(guard)),
            },
        );
        self
    }

    /// Guarded rule from each state in `from`, sharing one guard.
    pub fn guarded_from<G>(mut self, from: &[S], event: E, to: S, guard: G) -> Self
    where
        G: Fn(&C) -> Result<(), String> + Send + Sync + Clone + 'static,
    {
        for state in from {
            self = self.guarded(*state, event.clone(), to, guard.clone());
        }
        self
    }

    pub fn on_enter<H>(mut self, state: S, hook: H) -> Self
    where
        H: Fn(&C, &TransitionRecord<S, E>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.on_enter.entry(state).or_default().push(Box::new(hook));
        self
    }

    pub fn on_exit<H>(mut self, state: S, hook: H) -> Self
    where
        H: Fn(&C, &TransitionRecord<S, E>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.on_exit.entry(state).or_default().push(Box::new(hook));
        self
    }

    pub fn build(self) -> StateMachine<S, E, C> {
        StateMachine {
            initial: self.initial,
            rules: self.rules,
            on_enter: self.on_enter,
            on_exit: self.on_exit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Door {
        Closed,
        Open,
        Locked,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Action {
        Open,
        Close,
        Lock,
    }

    struct Ctx {
        has_key: bool,
    }

    fn door() -> StateMachine<Door, Action, Ctx> {
        StateMachine::builder(Door::Closed)
            .transition(Door::Closed, Action::Open, Door::Open)
            .transition(Door::Open, Action::Close, Door::Closed)
            .guarded(Door::Closed, Action::Lock, Door::Locked, |ctx: &Ctx| {
                if ctx.has_key {
                    Ok(())
                } else {
                    Err("no key".to_string())
                }
            })
            .build()
    }

    #[test]
    fn test_accepted_transition_is_recorded() {
        let machine = door();
        let mut instance = machine.new_instance();
        let record = machine
            .transition(&mut instance, Action::Open, &Ctx { has_key: false }, "tester", Some("airing".into()))
            .unwrap();

        assert_eq!(record.from, Door::Closed);
        assert_eq!(record.to, Door::Open);
        assert_eq!(instance.state(), Door::Open);
        assert_eq!(instance.history().len(), 1);
        assert_eq!(instance.history()[0].reason.as_deref(), Some("airing"));
    }

    #[test]
    fn test_unknown_pair_is_invalid() {
        let machine = door();
        let mut instance = machine.new_instance();
        let err = machine
            .transition(&mut instance, Action::Close, &Ctx { has_key: true }, "tester", None)
            .unwrap_err();

        assert_eq!(
            err,
            TransitionError::InvalidTransition {
                from: Door::Closed,
                event: Action::Close
            }
        );
        assert_eq!(instance.state(), Door::Closed);
        assert!(instance.history().is_empty());
    }

    #[test]
    fn test_guard_failure_leaves_state_unchanged() {
        let machine = door();
        let mut instance = machine.new_instance();
        let err = machine
            .transition(&mut instance, Action::Lock, &Ctx { has_key: false }, "tester", None)
            .unwrap_err();

        assert!(matches!(err, TransitionError::GuardFailed { ref reason, .. } if reason == "no key"));
        assert_eq!(instance.state(), Door::Closed);

        machine
            .transition(&mut instance, Action::Lock, &Ctx { has_key: true }, "tester", None)
            .unwrap();
        assert_eq!(instance.state(), Door::Locked);
    }

    #[test]
    fn test_failing_hook_rolls_back() {
        let exits = Arc::new(AtomicUsize::new(0));
        let exits_seen = exits.clone();

        let machine: StateMachine<Door, Action, Ctx> = StateMachine::builder(Door::Closed)
            .transition(Door::Closed, Action::Open, Door::Open)
            .on_exit(Door::Closed, move |_, _| {
                exits_seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_enter(Door::Open, |_, record| Err(format!("jammed while leaving {:?}", record.from)))
            .build();

        let mut instance = machine.new_instance();
        let err = machine
            .transition(&mut instance, Action::Open, &Ctx { has_key: false }, "tester", None)
            .unwrap_err();

        assert!(matches!(err, TransitionError::HookFailed { phase: HookPhase::Enter, .. }));
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(instance.state(), Door::Closed);
        assert!(instance.history().is_empty());
    }

    #[test]
    fn test_instance_serde_preserves_history() {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        enum S {
            A,
            B,
        }
        let machine: StateMachine<S, String, ()> =
            StateMachine::builder(S::A).transition(S::A, "go".to_string(), S::B).build();
        let mut instance = machine.new_instance();
        machine.transition(&mut instance, "go".to_string(), &(), "t", None).unwrap();

        let json = serde_json::to_value(&instance).unwrap();
        let back: MachineInstance<S, String> = serde_json::from_value(json).unwrap();
        assert_eq!(back, instance);
    }
}
