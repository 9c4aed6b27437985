use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use super::traits::{validate_checkpoint_name, CheckpointStore, MachineControl};
use crate::error::MachineError;
use crate::sync::lock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub revert: u32,
    pub start: u32,
    pub stop: u32,
    pub power_queries: u32,
    pub agent_pings: u32,
}

#[derive(Debug)]
struct SimState {
    running: bool,
    responsive: bool,
    checkpoints: Vec<String>,
    backend_failure: Option<String>,
    power_query_failure: Option<String>,
    calls: CallCounts,
}

/// A VM that lives entirely in memory. Reverting restores a running guest,
/// as a libvirt snapshot of a live domain does.
#[derive(Debug)]
pub struct SimulatedMachine {
    reference: String,
    latency: Duration,
    state: Mutex<SimState>,
}

impl SimulatedMachine {
    pub fn new(reference: impl Into<String>) -> Self {
        let reference = reference.into();
        Self {
            state: Mutex::new(SimState {
                running: false,
                responsive: true,
                checkpoints: vec![reference.clone()],
                backend_failure: None,
                power_query_failure: None,
                calls: CallCounts::default(),
            }),
            reference,
            latency: Duration::ZERO,
        }
    }

    /// Every control call takes this long, which makes overlap observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_running(&self, running: bool) {
        lock(&self.state).running = running;
    }

    /// Guest dies without anyone asking.
    pub fn crash(&self) {
        self.set_running(false);
    }

    pub fn set_responsive(&self, responsive: bool) {
        lock(&self.state).responsive = responsive;
    }

    /// Makes revert/start/stop fail with a backend error until cleared.
    pub fn set_backend_failure(&self, message: Option<&str>) {
        lock(&self.state).backend_failure = message.map(str::to_string);
    }

    pub fn set_power_query_failure(&self, message: Option<&str>) {
        lock(&self.state).power_query_failure = message.map(str::to_string);
    }

    pub fn calls(&self) -> CallCounts {
        lock(&self.state).calls
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn check_backend(&self) -> Result<(), MachineError> {
        match &lock(&self.state).backend_failure {
            Some(message) => Err(MachineError::Backend(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MachineControl for SimulatedMachine {
    async fn revert_to_reference(&self) -> Result<(), MachineError> {
        lock(&self.state).calls.revert += 1;
        self.pause().await;
        self.check_backend()?;

        let mut state = lock(&self.state);
        if !state.checkpoints.contains(&self.reference) {
            return Err(MachineError::ReferenceMissing(self.reference.clone()));
        }
        state.running = true;
        Ok(())
    }

    async fn start(&self) -> Result<(), MachineError> {
        lock(&self.state).calls.start += 1;
        self.pause().await;
        self.check_backend()?;
        lock(&self.state).running = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), MachineError> {
        lock(&self.state).calls.stop += 1;
        self.pause().await;
        self.check_backend()?;
        lock(&self.state).running = false;
        Ok(())
    }

    async fn is_running(&self) -> Result<bool, MachineError> {
        let mut state = lock(&self.state);
        state.calls.power_queries += 1;
        match &state.power_query_failure {
            Some(message) => Err(MachineError::Backend(message.clone())),
            None => Ok(state.running),
        }
    }

    async fn is_responsive(&self) -> Result<bool, MachineError> {
        let mut state = lock(&self.state);
        state.calls.agent_pings += 1;
        Ok(state.running && state.responsive)
    }
}

#[async_trait]
impl CheckpointStore for SimulatedMachine {
    fn reference_name(&self) -> &str {
        &self.reference
    }

    async fn list_checkpoints(&self) -> Result<Vec<String>, MachineError> {
        Ok(lock(&self.state).checkpoints.clone())
    }

    async fn create_checkpoint(&self, name: Option<&str>) -> Result<String, MachineError> {
        let name = name.unwrap_or(&self.reference).to_string();
        validate_checkpoint_name(&name)?;
        self.check_backend()?;

        let mut state = lock(&self.state);
        if !state.checkpoints.contains(&name) {
            state.checkpoints.push(name.clone());
        }
        Ok(name)
    }

    async fn delete_checkpoint(&self, name: &str) -> Result<(), MachineError> {
        validate_checkpoint_name(name)?;
        let mut state = lock(&self.state);
        let before = state.checkpoints.len();
        state.checkpoints.retain(|c| c != name);
        if state.checkpoints.len() == before {
            return Err(MachineError::Backend(format!("no checkpoint named '{}'", name)));
        }
        Ok(())
    }
}
