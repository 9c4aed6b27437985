use std::sync::Mutex;
use tokio::time::Instant;

use crate::sync::lock;

/// Proof that a recovery suspended the gate under a given generation.
/// Only the holder of the current ticket may resume the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct GateTicket {
    generation: u64,
}

impl GateTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
struct GateState {
    enabled: bool,
    generation: u64,
    enabled_at: Option<Instant>,
    suspended: bool,
}

/// Enable switch for health evaluation, tagged with a generation.
///
/// Every operation that changes the gate bumps the generation, so an effect
/// captured under an older generation (a tick that observed the gate, or a
/// recovery waiting to resume it) can detect that it has been overtaken.
#[derive(Debug)]
pub struct MonitorGate {
    state: Mutex<GateState>,
}

impl MonitorGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                enabled: false,
                generation: 0,
                enabled_at: None,
                suspended: false,
            }),
        }
    }

    /// Operator enable. Returns `true` if the gate was actually turned on.
    pub fn enable(&self) -> bool {
        let mut state = lock(&self.state);
        if state.enabled {
            return false;
        }
        state.generation += 1;
        state.enabled = true;
        state.enabled_at = Some(Instant::now());
        state.suspended = false;
        true
    }

    /// Operator disable. Also cancels a pending resume, so a recovery that
    /// finishes later leaves the gate off.
    pub fn disable(&self) -> bool {
        let mut state = lock(&self.state);
        if !state.enabled && !state.suspended {
            return false;
        }
        state.generation += 1;
        state.enabled = false;
        state.suspended = false;
        true
    }

    /// Turns the gate off on behalf of a recovery and hands out the ticket
    /// needed to turn it back on.
    pub fn suspend(&self) -> GateTicket {
        let mut state = lock(&self.state);
        state.generation += 1;
        state.enabled = false;
        state.suspended = true;
        GateTicket {
            generation: state.generation,
        }
    }

    /// Like [`suspend`](Self::suspend), but only if the gate is still enabled
    /// under `observed`.
    pub fn suspend_if_current(&self, observed: u64) -> Option<GateTicket> {
        let mut state = lock(&self.state);
        if !state.enabled || state.generation != observed {
            return None;
        }
        state.generation += 1;
        state.enabled = false;
        state.suspended = true;
        Some(GateTicket {
            generation: state.generation,
        })
    }

    /// Bumps the generation without changing the enabled flag, so triggers
    /// evaluated before this point are rejected. A pending resume is left
    /// valid; nothing can observe a suspended gate.
    pub fn invalidate_observations(&self) {
        let mut state = lock(&self.state);
        if state.enabled {
            state.generation += 1;
        }
    }

    /// Re-enables the gate if nothing has touched it since `ticket` was issued.
    pub fn resume(&self, ticket: GateTicket) -> bool {
        let mut state = lock(&self.state);
        if !state.suspended || state.generation != ticket.generation {
            return false;
        }
        state.generation += 1;
        state.enabled = true;
        state.enabled_at = Some(Instant::now());
        state.suspended = false;
        true
    }

    /// Gives up a suspension without re-enabling; the gate stays off.
    pub fn release(&self, ticket: GateTicket) {
        let mut state = lock(&self.state);
        if state.suspended && state.generation == ticket.generation {
            state.suspended = false;
        }
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    /// Off only until the holder of the current ticket resumes it.
    pub fn is_suspended(&self) -> bool {
        lock(&self.state).suspended
    }

    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    /// The generation to hand to a trigger, or `None` while disabled.
    pub fn enabled_generation(&self) -> Option<u64> {
        let state = lock(&self.state);
        state.enabled.then_some(state.generation)
    }

    pub fn seconds_since_enabled(&self) -> Option<f64> {
        let state = lock(&self.state);
        if !state.enabled {
            return None;
        }
        state
            .enabled_at
            .map(|at| Instant::now().duration_since(at).as_secs_f64())
    }
}

impl Default for MonitorGate {
    fn default() -> Self {
        Self::new()
    }
}
