use std::sync::Arc;

use super::gate::MonitorGate;
use super::power::PowerObservation;
use super::recovery::{RecoverySettings, RevertOrchestrator};
use crate::lifecycle::{
    ControllerStateMachine, HeartbeatTracker, ManualIntentTracker, StateInputs, StateLog,
};
use crate::machine::MachineControl;
use crate::types::ControllerState;

/// The watchdog's shared state, handed to both the monitor loop and the
/// controller. Each piece carries its own lock.
pub struct WatchdogCore {
    pub heartbeat: Arc<HeartbeatTracker>,
    pub intent: Arc<ManualIntentTracker>,
    pub gate: Arc<MonitorGate>,
    pub power: Arc<PowerObservation>,
    pub orchestrator: Arc<RevertOrchestrator>,
    pub machine: Arc<dyn MachineControl>,
    pub state_log: StateLog,
    /// Heartbeat timeout in seconds, also the first-signal grace window.
    pub timeout: f64,
}

impl WatchdogCore {
    pub fn new(machine: Arc<dyn MachineControl>, timeout: f64, recovery: RecoverySettings) -> Self {
        let heartbeat = Arc::new(HeartbeatTracker::new());
        let intent = Arc::new(ManualIntentTracker::new());
        let gate = Arc::new(MonitorGate::new());
        let power = Arc::new(PowerObservation::new());
        let orchestrator = Arc::new(RevertOrchestrator::new(
            machine.clone(),
            gate.clone(),
            heartbeat.clone(),
            intent.clone(),
            power.clone(),
            recovery,
        ));

        Self {
            heartbeat,
            intent,
            gate,
            power,
            orchestrator,
            machine,
            state_log: StateLog::new(),
            timeout,
        }
    }

    pub fn inputs(&self) -> StateInputs {
        StateInputs {
            recovering: self.orchestrator.is_recovering(),
            last_recovery_failed: self.orchestrator.last_recovery_failed(),
            manual_intent: self.intent.current(),
            gate_enabled: self.gate.is_enabled(),
            since_enabled: self.gate.seconds_since_enabled(),
            verdict: self.heartbeat.is_healthy(self.timeout),
            machine_running: self.power.last(),
            timeout: self.timeout,
        }
    }

    pub fn state(&self) -> ControllerState {
        ControllerStateMachine::derive(&self.inputs())
    }

    /// Derives the state and records it if it changed.
    pub fn observe_state(&self) -> ControllerState {
        let state = self.state();
        self.state_log.observe(state);
        state
    }
}
