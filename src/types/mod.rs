pub mod recovery;
pub mod status;

pub use recovery::{RecoveryOutcome, RecoveryReason, RecoveryRecord, RecoveryStats};
pub use status::{HeartbeatStatus, StatusSnapshot};

use serde::{Deserialize, Serialize};

pub type RecoveryId = uuid::Uuid;

/// Observable lifecycle of the controller. Always derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerState {
    Initializing,        // Gate not (yet) enabled
    AwaitingFirstSignal, // Grace window running, no heartbeat since enable
    Healthy,             // Heartbeats arriving within the timeout
    Unhealthy,           // Timed out, crashed, or last recovery failed
    Recovering,          // Revert sequence in flight
    ManuallyStopped,     // Operator stopped the VM
}

impl ControllerState {
    pub fn as_str(&self) -> &str {
        match self {
            ControllerState::Initializing => "Initializing",
            ControllerState::AwaitingFirstSignal => "AwaitingFirstSignal",
            ControllerState::Healthy => "Healthy",
            ControllerState::Unhealthy => "Unhealthy",
            ControllerState::Recovering => "Recovering",
            ControllerState::ManuallyStopped => "ManuallyStopped",
        }
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthVerdict {
    NeverSignaled,
    Healthy,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManualIntent {
    None,
    Stop,
    Start,
}

impl ManualIntent {
    pub fn as_str(&self) -> &str {
        match self {
            ManualIntent::None => "None",
            ManualIntent::Stop => "Stop",
            ManualIntent::Start => "Start",
        }
    }
}
