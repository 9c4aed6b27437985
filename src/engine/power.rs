use std::sync::Mutex;

use crate::sync::lock;

/// Last power state seen by anyone talking to the backend. Status queries
/// read this instead of calling the backend themselves.
#[derive(Debug, Default)]
pub struct PowerObservation {
    running: Mutex<Option<bool>>,
}

impl PowerObservation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, running: bool) {
        *lock(&self.running) = Some(running);
    }

    pub fn forget(&self) {
        *lock(&self.running) = None;
    }

    pub fn last(&self) -> Option<bool> {
        *lock(&self.running)
    }
}
