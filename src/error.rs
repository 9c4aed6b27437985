use thiserror::Error;

/// Failures reported by a machine-control backend.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("reference checkpoint '{0}' does not exist")]
    ReferenceMissing(String),

    #[error("backend command failed: {0}")]
    Backend(String),

    #[error("backend call timed out after {0:.1}s")]
    Timeout(f64),

    #[error("invalid checkpoint name '{0}'")]
    InvalidCheckpointName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result of asking the orchestrator to run a recovery.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("machine backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("a recovery is already in progress")]
    AlreadyInProgress,

    #[error("reference checkpoint '{0}' is missing")]
    ReferenceMissing(String),

    #[error("monitoring gate changed since the trigger was observed")]
    Superseded,
}

impl RecoveryError {
    /// Concurrency signals that callers absorb instead of reporting.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            RecoveryError::AlreadyInProgress | RecoveryError::Superseded
        )
    }
}

impl From<MachineError> for RecoveryError {
    fn from(err: MachineError) -> Self {
        match err {
            MachineError::ReferenceMissing(name) => RecoveryError::ReferenceMissing(name),
            other => RecoveryError::BackendUnavailable(other.to_string()),
        }
    }
}

/// Failures of operator control requests.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a recovery is in progress; try again when it finishes")]
    RecoveryInProgress,

    #[error(transparent)]
    Machine(#[from] MachineError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_missing_maps_through() {
        let err: RecoveryError = MachineError::ReferenceMissing("ready".to_string()).into();
        assert!(matches!(err, RecoveryError::ReferenceMissing(ref name) if name == "ready"));
    }

    #[test]
    fn test_backend_failure_maps_to_unavailable() {
        let err: RecoveryError = MachineError::Backend("virsh exited with 1".to_string()).into();
        assert!(matches!(err, RecoveryError::BackendUnavailable(_)));
        assert!(!err.is_benign());
    }

    #[test]
    fn test_concurrency_signals_are_benign() {
        assert!(RecoveryError::AlreadyInProgress.is_benign());
        assert!(RecoveryError::Superseded.is_benign());
    }
}
