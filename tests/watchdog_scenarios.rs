//! End-to-end watchdog scenarios against the simulated VM.
//!
//! All tests run on a paused clock, so "t=10" below means ten seconds of
//! virtual time after monitoring was enabled.

use std::sync::Arc;
use std::time::Duration;

use vm_warden::engine::{MonitorSettings, RecoverySettings};
use vm_warden::machine::SimulatedMachine;
use vm_warden::{
    ControlError, Controller, ControllerSettings, ControllerState, RecoveryError, RecoveryReason,
    StartupOptions,
};

const TIMEOUT: f64 = 10.0;
const SETTLE: Duration = Duration::from_secs(4);

struct Harness {
    machine: Arc<SimulatedMachine>,
    controller: Arc<Controller>,
    origin: tokio::time::Instant,
}

impl Harness {
    async fn start(machine: SimulatedMachine) -> Self {
        let machine = Arc::new(machine);
        machine.set_running(true);
        let controller = Arc::new(Controller::new(
            machine.clone(),
            ControllerSettings {
                heartbeat_timeout: TIMEOUT,
                recovery: RecoverySettings {
                    settle_delay: SETTLE,
                    readiness: None,
                },
                monitor: MonitorSettings {
                    check_interval: Duration::from_millis(500),
                },
                manual_start_reverts: true,
            },
        ));
        controller
            .start(StartupOptions {
                revert_on_startup: false,
                monitoring_enabled: true,
            })
            .await
            .unwrap();

        Self {
            machine,
            controller,
            origin: tokio::time::Instant::now(),
        }
    }

    /// Sleeps until `secs` seconds after monitoring was enabled.
    async fn at(&self, secs: f64) {
        tokio::time::sleep_until(self.origin + Duration::from_secs_f64(secs)).await;
    }

    fn state(&self) -> ControllerState {
        self.controller.get_status().state
    }

    fn reverts(&self) -> u32 {
        self.machine.calls().revert
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_guest_is_recovered_then_healthy() {
    let h = Harness::start(SimulatedMachine::new("ready")).await;

    h.at(9.9).await;
    assert_eq!(h.state(), ControllerState::AwaitingFirstSignal);
    assert_eq!(h.reverts(), 0);

    h.at(10.1).await;
    assert_eq!(h.reverts(), 1);
    assert_eq!(h.state(), ControllerState::Recovering);

    h.at(14.1).await;
    assert_eq!(h.state(), ControllerState::AwaitingFirstSignal);

    h.at(15.0).await;
    h.controller.record_signal();
    assert_eq!(h.state(), ControllerState::Healthy);

    // The guest keeps signalling from here on.
    for second in 16..40 {
        h.at(second as f64).await;
        h.controller.record_signal();
    }
    assert_eq!(h.reverts(), 1);
    assert_eq!(h.state(), ControllerState::Healthy);

    let stats = h.controller.get_status().recovery;
    assert_eq!(stats.attempted, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(
        stats.last.unwrap().reason,
        RecoveryReason::FirstSignalTimeout
    );
    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_guest_after_recovery_is_recovered_again() {
    let h = Harness::start(SimulatedMachine::new("ready")).await;

    h.at(23.9).await;
    assert_eq!(h.reverts(), 1);
    assert_eq!(h.state(), ControllerState::AwaitingFirstSignal);

    h.at(24.1).await;
    assert_eq!(h.reverts(), 2);
    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_loss_triggers_recovery() {
    let h = Harness::start(SimulatedMachine::new("ready")).await;
    h.at(1.0).await;
    h.controller.record_signal();

    h.at(10.9).await;
    assert_eq!(h.reverts(), 0);
    assert_eq!(h.state(), ControllerState::Healthy);

    h.at(11.1).await;
    assert_eq!(h.reverts(), 1);
    let stats = h.controller.get_status().recovery;
    assert_eq!(stats.in_progress, Some(RecoveryReason::HeartbeatTimeout));
    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_stop_is_not_a_failure() {
    let h = Harness::start(SimulatedMachine::new("ready")).await;
    h.at(1.0).await;
    h.controller.record_signal();

    h.at(5.0).await;
    h.controller.request_manual_stop().await.unwrap();
    assert_eq!(h.state(), ControllerState::ManuallyStopped);

    h.at(6.0).await;
    assert_eq!(h.reverts(), 0);
    assert_eq!(h.state(), ControllerState::ManuallyStopped);

    // Long past both the heartbeat timeout and the stop.
    h.at(19.9).await;
    assert_eq!(h.reverts(), 0);
    assert_eq!(h.state(), ControllerState::ManuallyStopped);

    h.at(20.0).await;
    h.controller.request_manual_start().await.unwrap();
    assert_eq!(h.state(), ControllerState::Initializing);

    h.at(24.1).await;
    assert_eq!(h.state(), ControllerState::AwaitingFirstSignal);
    // The manual start reverted once; the watchdog never did.
    assert_eq!(h.reverts(), 1);
    assert_eq!(h.controller.get_status().recovery.attempted, 0);

    h.controller.record_signal();
    assert_eq!(h.state(), ControllerState::Healthy);

    let path: Vec<_> = h
        .controller
        .recent_transitions(10)
        .into_iter()
        .map(|t| t.to)
        .collect();
    assert!(path.ends_with(&[
        ControllerState::ManuallyStopped,
        ControllerState::Initializing,
        ControllerState::AwaitingFirstSignal,
        ControllerState::Healthy,
    ]));
    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_power_off_is_recovered() {
    let h = Harness::start(SimulatedMachine::new("ready")).await;
    h.at(1.0).await;
    h.controller.record_signal();

    h.at(2.0).await;
    h.machine.crash();

    h.at(2.6).await;
    assert_eq!(h.reverts(), 1);
    let last = h.controller.get_status().recovery.in_progress;
    assert_eq!(last, Some(RecoveryReason::MachineStopped));

    h.at(7.0).await;
    assert_eq!(h.state(), ControllerState::AwaitingFirstSignal);
    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_recoveries_run_once() {
    let h = Harness::start(SimulatedMachine::new("ready").with_latency(Duration::from_secs(1)))
        .await;
    h.controller.disable_monitoring();
    let orchestrator = h.controller.core().orchestrator.clone();

    let (first, second) = tokio::join!(
        orchestrator.recover(RecoveryReason::OperatorRestart),
        orchestrator.recover(RecoveryReason::GuestReportedError),
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Err(RecoveryError::AlreadyInProgress)))
            .count(),
        1
    );
    assert_eq!(h.reverts(), 1);
    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_operator_toggle_during_recovery_wins() {
    let h = Harness::start(SimulatedMachine::new("ready")).await;

    let controller = h.controller.clone();
    let restart = tokio::spawn(async move { controller.request_restart().await });

    h.at(1.0).await;
    assert!(h.controller.disable_monitoring());
    h.at(2.0).await;
    assert!(h.controller.enable_monitoring());
    let generation = h.controller.core().gate.generation();

    restart.await.unwrap().unwrap();
    assert!(h.controller.core().gate.is_enabled());
    assert_eq!(h.controller.core().gate.generation(), generation);
    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_operator_disable_during_recovery_sticks() {
    let h = Harness::start(SimulatedMachine::new("ready")).await;

    let controller = h.controller.clone();
    let restart = tokio::spawn(async move { controller.request_restart().await });

    h.at(1.0).await;
    assert!(h.controller.disable_monitoring());
    assert!(!h.controller.disable_monitoring());

    restart.await.unwrap().unwrap();
    assert!(!h.controller.core().gate.is_enabled());

    h.at(60.0).await;
    assert_eq!(h.reverts(), 1);
    assert_eq!(h.state(), ControllerState::Initializing);
    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_recovery_is_not_retried() {
    let h = Harness::start(SimulatedMachine::new("ready")).await;
    h.machine.set_backend_failure(Some("libvirtd not reachable"));

    h.at(10.1).await;
    assert_eq!(h.reverts(), 1);
    assert_eq!(h.state(), ControllerState::Unhealthy);

    h.at(120.0).await;
    assert_eq!(h.reverts(), 1);
    let status = h.controller.get_status();
    assert_eq!(status.state, ControllerState::Unhealthy);
    assert!(!status.monitoring_enabled);
    assert_eq!(status.recovery.failed, 1);

    // Operator fixes the host and re-arms the watchdog.
    h.machine.set_backend_failure(None);
    assert!(h.controller.enable_monitoring());
    assert_eq!(h.state(), ControllerState::AwaitingFirstSignal);

    h.at(130.1).await;
    assert_eq!(h.reverts(), 2);
    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_requests_wait_for_recovery() {
    let h = Harness::start(SimulatedMachine::new("ready")).await;

    h.at(10.1).await;
    assert_eq!(h.state(), ControllerState::Recovering);
    assert!(matches!(
        h.controller.request_manual_stop().await,
        Err(ControlError::RecoveryInProgress)
    ));

    h.at(14.1).await;
    h.controller.request_manual_stop().await.unwrap();
    assert_eq!(h.state(), ControllerState::ManuallyStopped);
    h.controller.shutdown().await;
}
