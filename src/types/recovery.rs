use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RecoveryId;

/// What caused a recovery to be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryReason {
    HeartbeatTimeout,
    FirstSignalTimeout,
    MachineStopped,
    GuestReportedError,
    OperatorRestart,
    Startup,
}

impl RecoveryReason {
    pub fn as_str(&self) -> &str {
        match self {
            RecoveryReason::HeartbeatTimeout => "HeartbeatTimeout",
            RecoveryReason::FirstSignalTimeout => "FirstSignalTimeout",
            RecoveryReason::MachineStopped => "MachineStopped",
            RecoveryReason::GuestReportedError => "GuestReportedError",
            RecoveryReason::OperatorRestart => "OperatorRestart",
            RecoveryReason::Startup => "Startup",
        }
    }

    /// Automatic triggers are the ones raised by the watchdog itself rather
    /// than by an operator or the startup sequence.
    pub fn is_automatic(&self) -> bool {
        matches!(
            self,
            RecoveryReason::HeartbeatTimeout
                | RecoveryReason::FirstSignalTimeout
                | RecoveryReason::MachineStopped
                | RecoveryReason::GuestReportedError
        )
    }
}

impl std::fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryOutcome {
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub id: RecoveryId,
    pub reason: RecoveryReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RecoveryOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_progress: Option<RecoveryReason>,
    pub last_error: Option<String>,
    pub last: Option<RecoveryRecord>,
}
