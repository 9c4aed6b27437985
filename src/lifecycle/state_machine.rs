use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::types::{ControllerState, HealthVerdict, ManualIntent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerEvent {
    MonitorEnabled,
    SignalReceived,
    GraceWindowElapsed,
    TimeoutElapsed,
    MachineStoppedUnexpectedly,
    RecoveryTriggered,
    RecoveryCompleted,
    RecoveryFailed,
    ManualStopAccepted,
    ManualStartAccepted,
}

impl ControllerEvent {
    pub const ALL: [ControllerEvent; 10] = [
        ControllerEvent::MonitorEnabled,
        ControllerEvent::SignalReceived,
        ControllerEvent::GraceWindowElapsed,
        ControllerEvent::TimeoutElapsed,
        ControllerEvent::MachineStoppedUnexpectedly,
        ControllerEvent::RecoveryTriggered,
        ControllerEvent::RecoveryCompleted,
        ControllerEvent::RecoveryFailed,
        ControllerEvent::ManualStopAccepted,
        ControllerEvent::ManualStartAccepted,
    ];
}

/// Everything the observable state is computed from.
#[derive(Debug, Clone, Copy)]
pub struct StateInputs {
    pub recovering: bool,
    pub last_recovery_failed: bool,
    pub manual_intent: ManualIntent,
    pub gate_enabled: bool,
    /// Seconds since the gate was last enabled.
    pub since_enabled: Option<f64>,
    pub verdict: HealthVerdict,
    pub machine_running: Option<bool>,
    pub timeout: f64,
}

pub struct ControllerStateMachine;

impl ControllerStateMachine {
    pub fn transition(state: ControllerState, event: ControllerEvent) -> Result<ControllerState> {
        let new_state = match (state, event) {
            (ControllerState::Initializing, ControllerEvent::MonitorEnabled) => {
                ControllerState::AwaitingFirstSignal
            }
            (
                ControllerState::AwaitingFirstSignal | ControllerState::Healthy,
                ControllerEvent::SignalReceived,
            ) => ControllerState::Healthy,
            (ControllerState::AwaitingFirstSignal, ControllerEvent::GraceWindowElapsed) => {
                ControllerState::Unhealthy
            }
            (
                ControllerState::Healthy,
                ControllerEvent::TimeoutElapsed | ControllerEvent::MachineStoppedUnexpectedly,
            ) => ControllerState::Unhealthy,
            (ControllerState::Unhealthy, ControllerEvent::RecoveryTriggered) => {
                ControllerState::Recovering
            }
            (ControllerState::Recovering, ControllerEvent::RecoveryCompleted) => {
                ControllerState::AwaitingFirstSignal
            }
            (ControllerState::Recovering, ControllerEvent::RecoveryFailed) => {
                ControllerState::Unhealthy
            }
            (
                ControllerState::Healthy
                | ControllerState::Unhealthy
                | ControllerState::AwaitingFirstSignal,
                ControllerEvent::ManualStopAccepted,
            ) => ControllerState::ManuallyStopped,
            (ControllerState::ManuallyStopped, ControllerEvent::ManualStartAccepted) => {
                ControllerState::Initializing
            }

            _ => {
                return Err(anyhow!(
                    "Invalid state transition from {:?} with event {:?}",
                    state,
                    event
                ));
            }
        };

        Ok(new_state)
    }

    /// True when some event in the lifecycle table leads from `from` to `to`.
    pub fn is_allowed(from: ControllerState, to: ControllerState) -> bool {
        from == to
            || ControllerEvent::ALL
                .iter()
                .any(|event| matches!(Self::transition(from, *event), Ok(next) if next == to))
    }

    pub fn derive(inputs: &StateInputs) -> ControllerState {
        if inputs.recovering {
            return ControllerState::Recovering;
        }
        if inputs.manual_intent == ManualIntent::Stop {
            return ControllerState::ManuallyStopped;
        }
        if !inputs.gate_enabled {
            return if inputs.last_recovery_failed {
                ControllerState::Unhealthy
            } else {
                ControllerState::Initializing
            };
        }
        if inputs.machine_running == Some(false) {
            return ControllerState::Unhealthy;
        }

        match inputs.verdict {
            HealthVerdict::Healthy => ControllerState::Healthy,
            HealthVerdict::TimedOut => ControllerState::Unhealthy,
            HealthVerdict::NeverSignaled => match inputs.since_enabled {
                Some(elapsed) if elapsed >= inputs.timeout => ControllerState::Unhealthy,
                _ => ControllerState::AwaitingFirstSignal,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_inputs() -> StateInputs {
        StateInputs {
            recovering: false,
            last_recovery_failed: false,
            manual_intent: ManualIntent::None,
            gate_enabled: true,
            since_enabled: Some(30.0),
            verdict: HealthVerdict::Healthy,
            machine_running: Some(true),
            timeout: 10.0,
        }
    }

    #[test]
    fn test_initializing_to_awaiting() {
        let next = ControllerStateMachine::transition(
            ControllerState::Initializing,
            ControllerEvent::MonitorEnabled,
        );
        assert_eq!(next.unwrap(), ControllerState::AwaitingFirstSignal);
    }

    #[test]
    fn test_recovery_round_trip() {
        let state = ControllerStateMachine::transition(
            ControllerState::Unhealthy,
            ControllerEvent::RecoveryTriggered,
        )
        .unwrap();
        assert_eq!(state, ControllerState::Recovering);

        let state =
            ControllerStateMachine::transition(state, ControllerEvent::RecoveryCompleted).unwrap();
        assert_eq!(state, ControllerState::AwaitingFirstSignal);
    }

    #[test]
    fn test_failed_recovery_returns_to_unhealthy() {
        let state = ControllerStateMachine::transition(
            ControllerState::Recovering,
            ControllerEvent::RecoveryFailed,
        );
        assert_eq!(state.unwrap(), ControllerState::Unhealthy);
    }

    #[test]
    fn test_manual_stop_not_allowed_while_recovering() {
        let result = ControllerStateMachine::transition(
            ControllerState::Recovering,
            ControllerEvent::ManualStopAccepted,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_manual_start_reinitializes() {
        let state = ControllerStateMachine::transition(
            ControllerState::ManuallyStopped,
            ControllerEvent::ManualStartAccepted,
        );
        assert_eq!(state.unwrap(), ControllerState::Initializing);
    }

    #[test]
    fn test_is_allowed() {
        assert!(ControllerStateMachine::is_allowed(
            ControllerState::Healthy,
            ControllerState::Unhealthy
        ));
        assert!(ControllerStateMachine::is_allowed(
            ControllerState::Healthy,
            ControllerState::Healthy
        ));
        assert!(!ControllerStateMachine::is_allowed(
            ControllerState::ManuallyStopped,
            ControllerState::Healthy
        ));
    }

    #[test]
    fn test_derive_healthy() {
        assert_eq!(
            ControllerStateMachine::derive(&healthy_inputs()),
            ControllerState::Healthy
        );
    }

    #[test]
    fn test_derive_grace_window() {
        let mut inputs = healthy_inputs();
        inputs.verdict = HealthVerdict::NeverSignaled;
        inputs.since_enabled = Some(9.5);
        assert_eq!(
            ControllerStateMachine::derive(&inputs),
            ControllerState::AwaitingFirstSignal
        );

        inputs.since_enabled = Some(10.0);
        assert_eq!(
            ControllerStateMachine::derive(&inputs),
            ControllerState::Unhealthy
        );
    }

    #[test]
    fn test_derive_precedence() {
        let mut inputs = healthy_inputs();
        inputs.manual_intent = ManualIntent::Stop;
        inputs.machine_running = Some(false);
        assert_eq!(
            ControllerStateMachine::derive(&inputs),
            ControllerState::ManuallyStopped
        );

        inputs.recovering = true;
        assert_eq!(
            ControllerStateMachine::derive(&inputs),
            ControllerState::Recovering
        );
    }

    #[test]
    fn test_derive_disabled_gate() {
        let mut inputs = healthy_inputs();
        inputs.gate_enabled = false;
        assert_eq!(
            ControllerStateMachine::derive(&inputs),
            ControllerState::Initializing
        );

        inputs.last_recovery_failed = true;
        assert_eq!(
            ControllerStateMachine::derive(&inputs),
            ControllerState::Unhealthy
        );
    }

    #[test]
    fn test_derive_machine_stopped() {
        let mut inputs = healthy_inputs();
        inputs.machine_running = Some(false);
        assert_eq!(
            ControllerStateMachine::derive(&inputs),
            ControllerState::Unhealthy
        );
    }
}
