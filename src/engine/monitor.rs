use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::watchdog::WatchdogCore;
use crate::types::{HealthVerdict, RecoveryReason};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub check_interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(500),
        }
    }
}

/// What a single evaluation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    GateDisabled,
    RecoveryRunning,
    ManuallyStopped,
    Healthy,
    AwaitingFirstSignal,
    RecoveryStarted(RecoveryReason),
    /// A trigger fired but lost a race with another recovery or an operator.
    RecoveryAbsorbed,
}

/// The watchdog loop. Each tick reads the trackers and the machine's power
/// state and hands unhealthy verdicts to the orchestrator.
pub struct HealthMonitor {
    core: Arc<WatchdogCore>,
    settings: MonitorSettings,
}

impl HealthMonitor {
    pub fn new(core: Arc<WatchdogCore>, settings: MonitorSettings) -> Self {
        Self { core, settings }
    }

    pub fn enable(&self) -> bool {
        self.core.gate.enable()
    }

    pub fn disable(&self) -> bool {
        self.core.gate.disable()
    }

    pub async fn tick(&self) -> TickOutcome {
        let core = &self.core;
        let Some(observed) = core.gate.enabled_generation() else {
            core.observe_state();
            return TickOutcome::GateDisabled;
        };
        if core.orchestrator.is_recovering() {
            return TickOutcome::RecoveryRunning;
        }
        if core.intent.was_manual_stop_most_recent() {
            core.observe_state();
            return TickOutcome::ManuallyStopped;
        }

        let running = match core.machine.is_running().await {
            Ok(running) => {
                core.power.record(running);
                core.intent.acknowledge_power(running);
                Some(running)
            }
            Err(e) => {
                log::warn!("Power state query failed, treating as unknown: {}", e);
                core.power.forget();
                None
            }
        };

        // The operator may have stopped the machine while the query was out.
        if core.intent.was_manual_stop_most_recent() {
            core.observe_state();
            return TickOutcome::ManuallyStopped;
        }

        let verdict = core.heartbeat.is_healthy(core.timeout);
        let reason = if running == Some(false) {
            Some(RecoveryReason::MachineStopped)
        } else {
            match verdict {
                HealthVerdict::TimedOut => Some(RecoveryReason::HeartbeatTimeout),
                HealthVerdict::NeverSignaled => {
                    let since_enabled = core.gate.seconds_since_enabled().unwrap_or(0.0);
                    (since_enabled >= core.timeout).then_some(RecoveryReason::FirstSignalTimeout)
                }
                HealthVerdict::Healthy => None,
            }
        };

        core.observe_state();
        let Some(reason) = reason else {
            return match verdict {
                HealthVerdict::Healthy => TickOutcome::Healthy,
                _ => TickOutcome::AwaitingFirstSignal,
            };
        };

        match reason {
            RecoveryReason::HeartbeatTimeout => log::warn!(
                "No heartbeat for {:.1}s (timeout {:.1}s)",
                core.heartbeat.seconds_since_last_signal().unwrap_or_default(),
                core.timeout
            ),
            RecoveryReason::FirstSignalTimeout => log::warn!(
                "No heartbeat received within {:.1}s of enabling monitoring",
                core.timeout
            ),
            _ => log::warn!("VM is not running and no manual stop was requested"),
        }

        match core.orchestrator.begin(reason, Some(observed)) {
            Ok(run) => {
                // The run finishes on its own; the outcome lands in the stats.
                drop(run.spawn());
                core.observe_state();
                TickOutcome::RecoveryStarted(reason)
            }
            Err(e) if e.is_benign() => {
                log::debug!("Recovery trigger absorbed: {}", e);
                TickOutcome::RecoveryAbsorbed
            }
            Err(e) => {
                log::error!("Could not start recovery: {}", e);
                TickOutcome::RecoveryAbsorbed
            }
        }
    }

    /// Ticks until `shutdown` flips to `true` or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!(
            "Health monitor running every {:.1}s (timeout {:.1}s)",
            self.settings.check_interval.as_secs_f64(),
            self.core.timeout
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Health monitor stopped");
    }

    pub fn spawn(self: Arc<Self>) -> MonitorHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(receiver).await });
        MonitorHandle { shutdown, task }
    }
}

pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::warn!("Health monitor task ended abnormally: {}", e);
        }
    }
}
