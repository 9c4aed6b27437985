use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

use crate::error::MachineError;

/// Power and revert control over the one guest VM.
///
/// Implementations must not retry internally; every failure is reported to
/// the caller, which decides what a failed cycle means.
#[async_trait]
pub trait MachineControl: Send + Sync {
    /// Restore the reference checkpoint. Fails with
    /// [`MachineError::ReferenceMissing`] if it does not exist.
    async fn revert_to_reference(&self) -> Result<(), MachineError>;
    async fn start(&self) -> Result<(), MachineError>;
    /// Hard power-off. Stopping a stopped machine is not an error.
    async fn stop(&self) -> Result<(), MachineError>;
    async fn is_running(&self) -> Result<bool, MachineError>;

    /// Guest agent ping. Backends without an agent report responsive.
    async fn is_responsive(&self) -> Result<bool, MachineError> {
        Ok(true)
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    fn reference_name(&self) -> &str;

    async fn list_checkpoints(&self) -> Result<Vec<String>, MachineError>;

    /// Creates (or replaces) a checkpoint; `None` means the reference one.
    /// Returns the name that was written.
    async fn create_checkpoint(&self, name: Option<&str>) -> Result<String, MachineError>;

    async fn delete_checkpoint(&self, name: &str) -> Result<(), MachineError>;

    async fn reference_exists(&self) -> Result<bool, MachineError> {
        let reference = self.reference_name().to_string();
        Ok(self.list_checkpoints().await?.contains(&reference))
    }
}

fn checkpoint_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("checkpoint name pattern is valid")
    })
}

/// Checkpoint names end up as backend command arguments, so only a
/// conservative character set is accepted.
pub fn validate_checkpoint_name(name: &str) -> Result<(), MachineError> {
    if checkpoint_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(MachineError::InvalidCheckpointName(name.to_string()))
    }
}
