pub mod controller;
pub mod gate;
pub mod monitor;
pub mod power;
pub mod recovery;
pub mod watchdog;

pub use controller::{Controller, ControllerSettings, StartupOptions};
pub use gate::{GateTicket, MonitorGate};
pub use monitor::{HealthMonitor, MonitorHandle, MonitorSettings, TickOutcome};
pub use power::PowerObservation;
pub use recovery::{ReadinessCheck, RecoveryRun, RecoverySettings, RevertOrchestrator};
pub use watchdog::WatchdogCore;
