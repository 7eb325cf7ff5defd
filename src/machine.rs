//! Table-driven state machines.
//!
//! Both session kinds declare a static `(state, event) -> state` table.
//! [`StateMachine::handle`] looks the pair up and either moves to the next
//! state or fails without touching the current one.

use std::fmt::Debug;

use crate::error::{RelayError, Result};

/// One row of a transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, E> {
    /// State the row applies to
    pub from: S,
    /// Event accepted in that state
    pub event: E,
    /// State entered
    pub to: S,
}

impl<S, E> Transition<S, E> {
    /// Build a row.
    pub const fn new(from: S, event: E, to: S) -> Self {
        Self { from, event, to }
    }
}

/// Look up the next state for `(state, event)`.
pub fn next_state<S, E>(table: &[Transition<S, E>], state: S, event: E) -> Option<S>
where
    S: Copy + Eq,
    E: Copy + Eq,
{
    table
        .iter()
        .find(|t| t.from == state && t.event == event)
        .map(|t| t.to)
}

/// Current state plus the table that governs it
#[derive(Debug, Clone)]
pub struct StateMachine<S: 'static, E: 'static> {
    state: S,
    table: &'static [Transition<S, E>],
}

impl<S, E> StateMachine<S, E>
where
    S: Copy + Eq + Debug,
    E: Copy + Eq + Debug,
{
    /// Start in `initial`.
    pub fn new(initial: S, table: &'static [Transition<S, E>]) -> Self {
        Self {
            state: initial,
            table,
        }
    }

    /// Current state
    pub fn state(&self) -> S {
        self.state
    }

    /// Whether `event` is accepted in the current state.
    pub fn accepts(&self, event: E) -> bool {
        next_state(self.table, self.state, event).is_some()
    }

    /// Apply `event`. Unknown pairs fail and leave the state unchanged.
    pub fn handle(&mut self, event: E) -> Result<S> {
        let from = self.state;
        let to = next_state(self.table, from, event).ok_or_else(|| {
            RelayError::InvalidTransition {
                state: format!("{from:?}"),
                event: format!("{event:?}"),
            }
        })?;

        self.state = to;
        tracing::trace!(?from, ?event, ?to, "state transition");
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Door {
        Open,
        Closed,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Push {
        Close,
        Open,
    }

    const DOOR: &[Transition<Door, Push>] = &[
        Transition::new(Door::Open, Push::Close, Door::Closed),
        Transition::new(Door::Closed, Push::Open, Door::Open),
    ];

    #[test]
    fn test_valid_transition() {
        let mut m = StateMachine::new(Door::Open, DOOR);
        assert_eq!(m.handle(Push::Close).unwrap(), Door::Closed);
        assert_eq!(m.state(), Door::Closed);
    }

    #[test]
    fn test_invalid_transition_keeps_state() {
        let mut m = StateMachine::new(Door::Open, DOOR);
        let err = m.handle(Push::Open).unwrap_err();
        assert_eq!(m.state(), Door::Open);
        assert_eq!(err.to_string(), "Invalid transition from Open via Open");
    }

    #[test]
    fn test_accepts() {
        let m = StateMachine::new(Door::Closed, DOOR);
        assert!(m.accepts(Push::Open));
        assert!(!m.accepts(Push::Close));
    }
}
