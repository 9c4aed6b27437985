use std::sync::{Arc, Mutex};

use super::monitor::{HealthMonitor, MonitorHandle, MonitorSettings};
use super::recovery::RecoverySettings;
use super::watchdog::WatchdogCore;
use crate::error::{ControlError, MachineError};
use crate::lifecycle::StateTransition;
use crate::machine::MachineControl;
use crate::sync::lock;
use crate::types::{
    ControllerState, HealthVerdict, HeartbeatStatus, ManualIntent, RecoveryReason, StatusSnapshot,
};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub heartbeat_timeout: f64,
    pub recovery: RecoverySettings,
    pub monitor: MonitorSettings,
    /// Manual start reverts to the reference checkpoint instead of booting
    /// whatever disk state the machine was stopped with.
    pub manual_start_reverts: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: 15.0,
            recovery: RecoverySettings::default(),
            monitor: MonitorSettings::default(),
            manual_start_reverts: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StartupOptions {
    pub revert_on_startup: bool,
    pub monitoring_enabled: bool,
}

/// Entry point for everything outside the watchdog: guest signals,
/// operator requests and status queries.
pub struct Controller {
    core: Arc<WatchdogCore>,
    monitor: Arc<HealthMonitor>,
    settings: ControllerSettings,
    monitor_handle: Mutex<Option<MonitorHandle>>,
}

impl Controller {
    pub fn new(machine: Arc<dyn MachineControl>, settings: ControllerSettings) -> Self {
        let core = Arc::new(WatchdogCore::new(
            machine,
            settings.heartbeat_timeout,
            settings.recovery.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(core.clone(), settings.monitor.clone()));
        Self {
            core,
            monitor,
            settings,
            monitor_handle: Mutex::new(None),
        }
    }

    pub fn core(&self) -> &Arc<WatchdogCore> {
        &self.core
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Brings the watchdog up: optional revert to the reference checkpoint,
    /// then the monitor loop, then the initial gate position.
    pub async fn start(&self, options: StartupOptions) -> Result<(), ControlError> {
        if options.revert_on_startup {
            log::info!("Reverting to the reference checkpoint before monitoring starts");
            self.core
                .orchestrator
                .recover(RecoveryReason::Startup)
                .await?;
            self.core.observe_state();
        }

        self.spawn_monitor();

        if options.monitoring_enabled {
            self.enable_monitoring();
        } else {
            self.disable_monitoring();
            log::info!("Automatic recovery is disabled; enable it through the API");
        }
        Ok(())
    }

    pub fn spawn_monitor(&self) {
        let mut handle = lock(&self.monitor_handle);
        if handle.is_none() {
            *handle = Some(self.monitor.clone().spawn());
        }
    }

    pub async fn shutdown(&self) {
        let handle = lock(&self.monitor_handle).take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub fn record_signal(&self) {
        self.core.heartbeat.record_signal();
        log::debug!(
            "Heartbeat received ({} total)",
            self.core.heartbeat.received_count()
        );
        self.core.observe_state();
    }

    /// Records the stop intent, then powers the machine off.
    pub async fn request_manual_stop(&self) -> Result<(), ControlError> {
        let core = &self.core;
        core.orchestrator
            .while_idle(|| {
                core.intent.note_manual_stop();
                core.gate.invalidate_observations();
            })
            .map_err(|_| ControlError::RecoveryInProgress)?;
        log::info!("Manual stop requested");
        core.observe_state();

        match core.machine.stop().await {
            Ok(()) => {
                core.power.record(false);
                log::info!("VM stopped by operator");
                Ok(())
            }
            Err(e) => {
                core.intent.clear();
                core.observe_state();
                log::error!("Manual stop failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Records the start intent and brings the machine up. Monitoring is
    /// held off for the settle delay and then re-armed in the background.
    pub async fn request_manual_start(&self) -> Result<(), ControlError> {
        let core = &self.core;
        let (ticket, rearm) = core
            .orchestrator
            .while_idle(|| {
                // A suspended gate here belongs to an earlier start that is
                // still settling; this start takes over its pending resume.
                let rearm = core.gate.is_enabled()
                    || core.gate.is_suspended()
                    || core.orchestrator.last_recovery_failed();
                core.intent.note_manual_start();
                core.heartbeat.reset();
                core.orchestrator.clear_failure();
                core.power.forget();
                (core.gate.suspend(), rearm)
            })
            .map_err(|_| ControlError::RecoveryInProgress)?;
        log::info!("Manual start requested");
        core.observe_state();

        if let Err(e) = self.bring_up().await {
            core.gate.release(ticket);
            core.intent.clear();
            core.orchestrator
                .note_control_failure(format!("manual start failed: {}", e));
            core.observe_state();
            log::error!("Manual start failed: {}", e);
            return Err(e.into());
        }
        core.power.record(true);
        core.observe_state();

        let core = self.core.clone();
        let settle_delay = self.settings.recovery.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(settle_delay).await;
            core.heartbeat.reset();
            if rearm && core.gate.resume(ticket) {
                log::info!("Heartbeat monitoring re-enabled after manual start");
            } else {
                core.gate.release(ticket);
            }
            core.observe_state();
        });
        Ok(())
    }

    async fn bring_up(&self) -> Result<(), MachineError> {
        let machine = &self.core.machine;
        if self.settings.manual_start_reverts {
            machine.revert_to_reference().await?;
        }
        if !machine.is_running().await? {
            machine.start().await?;
        }
        Ok(())
    }

    /// Operator-triggered recovery. Waits for the whole sequence.
    pub async fn request_restart(&self) -> Result<(), ControlError> {
        log::info!("Restart requested by operator");
        self.core
            .orchestrator
            .recover(RecoveryReason::OperatorRestart)
            .await?;
        self.core.observe_state();
        Ok(())
    }

    /// Returns `true` if monitoring was off and is now on.
    pub fn enable_monitoring(&self) -> bool {
        let changed = self.core.gate.enable();
        if changed {
            self.core.heartbeat.reset();
            self.core.orchestrator.clear_failure();
            log::info!(
                "Heartbeat monitoring enabled (timeout {:.1}s)",
                self.core.timeout
            );
        }
        self.core.observe_state();
        changed
    }

    pub fn disable_monitoring(&self) -> bool {
        let changed = self.core.gate.disable();
        if changed {
            log::info!("Heartbeat monitoring disabled");
        }
        self.core.observe_state();
        changed
    }

    /// The guest reported a failure of its own. Starts a recovery unless
    /// monitoring is off or the machine is stopped on purpose. Returns
    /// whether a recovery was started.
    pub fn report_guest_error(&self, detail: &str) -> bool {
        let core = &self.core;
        let Some(observed) = core.gate.enabled_generation() else {
            log::info!("Ignoring guest error while monitoring is disabled: {}", detail);
            return false;
        };
        if core.intent.was_manual_stop_most_recent() {
            log::info!("Ignoring guest error during manual stop: {}", detail);
            return false;
        }

        log::warn!("Guest reported an error: {}", detail);
        match core
            .orchestrator
            .begin(RecoveryReason::GuestReportedError, Some(observed))
        {
            Ok(run) => {
                drop(run.spawn());
                core.observe_state();
                true
            }
            Err(e) => {
                log::debug!("Guest error did not start a recovery: {}", e);
                false
            }
        }
    }

    pub fn get_status(&self) -> StatusSnapshot {
        let core = &self.core;
        let inputs = core.inputs();
        let state = crate::lifecycle::ControllerStateMachine::derive(&inputs);
        core.state_log.observe(state);

        let record = core.heartbeat.snapshot();
        let since = core.heartbeat.seconds_since_last_signal();
        StatusSnapshot {
            state,
            seconds_since_last_signal: since,
            is_healthy: state == ControllerState::Healthy,
            manual_stop_active: inputs.manual_intent == ManualIntent::Stop,
            manual_intent: inputs.manual_intent,
            monitoring_enabled: inputs.gate_enabled,
            machine_running: inputs.machine_running,
            heartbeat: HeartbeatStatus {
                enabled: inputs.gate_enabled,
                timeout: core.timeout,
                last_heartbeat: record.last_seen_at,
                time_since_heartbeat: since,
                is_timed_out: inputs.verdict == HealthVerdict::TimedOut,
                has_received_heartbeat: record.last_seen.is_some(),
                received_count: record.received_count,
            },
            recovery: core.orchestrator.stats(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.core.observe_state()
    }

    pub fn recent_transitions(&self, window: usize) -> Vec<StateTransition> {
        self.core.state_log.recent(window)
    }
}
