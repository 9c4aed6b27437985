use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use super::state_machine::ControllerStateMachine;
use crate::sync::lock;
use crate::types::ControllerState;

const MAX_TRANSITIONS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub timestamp: DateTime<Utc>,
    pub from: ControllerState,
    pub to: ControllerState,
}

#[derive(Debug)]
struct LogInner {
    current: ControllerState,
    history: VecDeque<StateTransition>,
}

/// Records changes of the derived controller state.
#[derive(Debug)]
pub struct StateLog {
    inner: Mutex<LogInner>,
}

impl StateLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                current: ControllerState::Initializing,
                history: VecDeque::new(),
            }),
        }
    }

    /// Returns the transition if `state` differs from the last observed one.
    pub fn observe(&self, state: ControllerState) -> Option<StateTransition> {
        let mut inner = lock(&self.inner);
        if inner.current == state {
            return None;
        }

        let transition = StateTransition {
            timestamp: Utc::now(),
            from: inner.current,
            to: state,
        };

        log::info!("Controller state: {} -> {}", transition.from, transition.to);
        if !ControllerStateMachine::is_allowed(transition.from, transition.to) {
            // Ticks sample the state, so a short-lived intermediate can be skipped.
            log::debug!("Transition skipped an intermediate state");
        }

        inner.current = state;
        inner.history.push_back(transition.clone());
        if inner.history.len() > MAX_TRANSITIONS {
            inner.history.pop_front();
        }

        Some(transition)
    }

    pub fn current(&self) -> ControllerState {
        lock(&self.inner).current
    }

    pub fn recent(&self, window: usize) -> Vec<StateTransition> {
        let inner = lock(&self.inner);
        let skip = inner.history.len().saturating_sub(window);
        inner.history.iter().skip(skip).cloned().collect()
    }
}

impl Default for StateLog {
    fn default() -> Self {
        Self::new()
    }
}
