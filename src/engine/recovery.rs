use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::gate::{GateTicket, MonitorGate};
use super::power::PowerObservation;
use crate::error::RecoveryError;
use crate::lifecycle::{HeartbeatTracker, ManualIntentTracker};
use crate::machine::MachineControl;
use crate::sync::lock;
use crate::types::{RecoveryId, RecoveryOutcome, RecoveryReason, RecoveryRecord, RecoveryStats};

/// Poll the guest agent after a revert before the settle delay starts.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessCheck {
    pub interval: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub settle_delay: Duration,
    pub readiness: Option<ReadinessCheck>,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(10),
            readiness: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RecoveryLock {
    Idle,
    InProgress {
        id: RecoveryId,
        reason: RecoveryReason,
    },
}

#[derive(Debug, Default)]
struct StatsInner {
    stats: RecoveryStats,
    /// Set by a failed sequence, cleared by the next success or an operator.
    failure_pending: bool,
}

/// Runs the revert sequence, at most one at a time.
pub struct RevertOrchestrator {
    machine: Arc<dyn MachineControl>,
    gate: Arc<MonitorGate>,
    heartbeat: Arc<HeartbeatTracker>,
    intent: Arc<ManualIntentTracker>,
    power: Arc<PowerObservation>,
    settings: RecoverySettings,
    slot: Mutex<RecoveryLock>,
    stats: Mutex<StatsInner>,
}

impl RevertOrchestrator {
    pub fn new(
        machine: Arc<dyn MachineControl>,
        gate: Arc<MonitorGate>,
        heartbeat: Arc<HeartbeatTracker>,
        intent: Arc<ManualIntentTracker>,
        power: Arc<PowerObservation>,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            machine,
            gate,
            heartbeat,
            intent,
            power,
            settings,
            slot: Mutex::new(RecoveryLock::Idle),
            stats: Mutex::new(StatsInner::default()),
        }
    }

    /// Runs a full recovery on the caller's task.
    pub async fn recover(self: &Arc<Self>, reason: RecoveryReason) -> Result<(), RecoveryError> {
        self.begin(reason, None)?.execute().await
    }

    /// Takes the recovery lock and suspends the gate without waiting.
    ///
    /// `observed` is the gate generation the trigger was evaluated under; if
    /// the gate moved on since then the trigger is [`RecoveryError::Superseded`].
    pub fn begin(
        self: &Arc<Self>,
        reason: RecoveryReason,
        observed: Option<u64>,
    ) -> Result<RecoveryRun, RecoveryError> {
        let id = uuid::Uuid::new_v4();
        let ticket = {
            let mut slot = lock(&self.slot);
            if let RecoveryLock::InProgress { id, reason } = *slot {
                log::debug!("Recovery {} ({}) already running", id, reason);
                return Err(RecoveryError::AlreadyInProgress);
            }

            let ticket = match observed {
                Some(generation) => self
                    .gate
                    .suspend_if_current(generation)
                    .ok_or(RecoveryError::Superseded)?,
                None => self.gate.suspend(),
            };
            *slot = RecoveryLock::InProgress { id, reason };
            ticket
        };

        self.intent.clear();
        {
            let mut stats = lock(&self.stats);
            stats.stats.attempted += 1;
            stats.stats.in_progress = Some(reason);
        }

        log::warn!("Recovery {} started: {}", id, reason);
        Ok(RecoveryRun {
            orchestrator: Arc::clone(self),
            id,
            reason,
            ticket,
            started_at: Utc::now(),
            finished: false,
        })
    }

    /// Runs `f` while holding the recovery lock, provided no recovery is in
    /// flight. Operator requests use this so that recording their intent
    /// cannot interleave with a recovery starting.
    pub fn while_idle<R>(&self, f: impl FnOnce() -> R) -> Result<R, RecoveryError> {
        let slot = lock(&self.slot);
        if matches!(*slot, RecoveryLock::InProgress { .. }) {
            return Err(RecoveryError::AlreadyInProgress);
        }
        Ok(f())
    }

    pub fn is_recovering(&self) -> bool {
        matches!(*lock(&self.slot), RecoveryLock::InProgress { .. })
    }

    pub fn last_recovery_failed(&self) -> bool {
        lock(&self.stats).failure_pending
    }

    /// Operator took over after a failed recovery.
    pub fn clear_failure(&self) {
        lock(&self.stats).failure_pending = false;
    }

    /// A control action outside the sequence (e.g. a manual start) failed
    /// and left the machine in an unknown state.
    pub fn note_control_failure(&self, message: impl Into<String>) {
        let mut stats = lock(&self.stats);
        stats.stats.last_error = Some(message.into());
        stats.failure_pending = true;
    }

    pub fn stats(&self) -> RecoveryStats {
        lock(&self.stats).stats.clone()
    }

    async fn run_sequence(&self, ticket: GateTicket) -> Result<(), RecoveryError> {
        self.machine.revert_to_reference().await?;
        if !self.machine.is_running().await? {
            self.machine.start().await?;
        }
        self.power.record(true);

        if let Some(check) = self.settings.readiness {
            self.wait_for_guest(check).await;
        }

        if !self.settings.settle_delay.is_zero() {
            log::info!(
                "Waiting {:.1}s for the guest to settle",
                self.settings.settle_delay.as_secs_f64()
            );
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        self.heartbeat.reset();
        if self.gate.resume(ticket) {
            log::info!("Heartbeat monitoring re-enabled");
        } else {
            log::info!("Monitoring gate changed during recovery, leaving it as the operator set it");
        }
        Ok(())
    }

    async fn wait_for_guest(&self, check: ReadinessCheck) -> bool {
        log::info!("Waiting for the guest agent to respond");
        for attempt in 1..=check.max_attempts {
            match self.machine.is_responsive().await {
                Ok(true) => {
                    log::info!("Guest responsive after {} attempt(s)", attempt);
                    return true;
                }
                Ok(false) => {}
                Err(e) => log::debug!("Guest agent check failed: {}", e),
            }
            if attempt < check.max_attempts {
                tokio::time::sleep(check.interval).await;
            }
        }

        log::warn!(
            "Guest did not respond after {} attempts, continuing anyway",
            check.max_attempts
        );
        false
    }

    fn finish(
        &self,
        id: RecoveryId,
        reason: RecoveryReason,
        ticket: GateTicket,
        started_at: DateTime<Utc>,
        result: &Result<(), RecoveryError>,
    ) {
        let outcome = match result {
            Ok(()) => RecoveryOutcome::Completed,
            Err(e) => {
                self.gate.release(ticket);
                RecoveryOutcome::Failed(e.to_string())
            }
        };

        {
            let mut stats = lock(&self.stats);
            stats.stats.in_progress = None;
            match &outcome {
                RecoveryOutcome::Completed => {
                    stats.stats.succeeded += 1;
                    stats.failure_pending = false;
                }
                RecoveryOutcome::Failed(message) => {
                    stats.stats.failed += 1;
                    stats.stats.last_error = Some(message.clone());
                    stats.failure_pending = true;
                }
            }
            stats.stats.last = Some(RecoveryRecord {
                id,
                reason,
                started_at,
                finished_at: Utc::now(),
                outcome: outcome.clone(),
            });
        }

        *lock(&self.slot) = RecoveryLock::Idle;

        match result {
            Ok(()) => log::info!("Recovery {} completed", id),
            Err(RecoveryError::ReferenceMissing(name)) => log::warn!(
                "Recovery {} aborted: reference snapshot '{}' is missing; create it and re-enable monitoring",
                id,
                name
            ),
            Err(e) => log::error!(
                "Recovery {} failed: {}; monitoring stays disabled until an operator intervenes",
                id,
                e
            ),
        }
    }
}

/// A recovery that holds the lock. Dropping it without running
/// [`execute`](Self::execute) to completion releases the lock and records
/// the run as abandoned.
pub struct RecoveryRun {
    orchestrator: Arc<RevertOrchestrator>,
    id: RecoveryId,
    reason: RecoveryReason,
    ticket: GateTicket,
    started_at: DateTime<Utc>,
    finished: bool,
}

impl RecoveryRun {
    pub fn id(&self) -> RecoveryId {
        self.id
    }

    pub fn reason(&self) -> RecoveryReason {
        self.reason
    }

    pub async fn execute(mut self) -> Result<(), RecoveryError> {
        let result = self.orchestrator.run_sequence(self.ticket).await;
        self.finished = true;
        self.orchestrator
            .finish(self.id, self.reason, self.ticket, self.started_at, &result);
        result
    }

    /// Runs the sequence on its own task so the caller can keep going.
    pub fn spawn(self) -> JoinHandle<Result<(), RecoveryError>> {
        tokio::spawn(self.execute())
    }
}

impl Drop for RecoveryRun {
    fn drop(&mut self) {
        if !self.finished {
            let abandoned = Err(RecoveryError::BackendUnavailable(
                "recovery task was cancelled".to_string(),
            ));
            self.orchestrator
                .finish(self.id, self.reason, self.ticket, self.started_at, &abandoned);
        }
    }
}
