use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ControllerState, ManualIntent, RecoveryStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatStatus {
    pub enabled: bool,
    pub timeout: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub time_since_heartbeat: Option<f64>,
    pub is_timed_out: bool,
    pub has_received_heartbeat: bool,
    pub received_count: u64,
}

/// Point-in-time view of the controller, built without touching the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: ControllerState,
    pub seconds_since_last_signal: Option<f64>,
    pub is_healthy: bool,
    pub manual_stop_active: bool,
    pub manual_intent: ManualIntent,
    pub monitoring_enabled: bool,
    pub machine_running: Option<bool>,
    pub heartbeat: HeartbeatStatus,
    pub recovery: RecoveryStats,
}
