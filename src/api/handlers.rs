use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::hooks::{validate_hook_name, SignalRoute};
use crate::lifecycle::StateTransition;
use crate::types::{HeartbeatStatus, StatusSnapshot};

const RECENT_TRANSITIONS: usize = 10;

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub vm_name: String,
    #[serde(flatten)]
    pub status: StatusSnapshot,
    pub recent_transitions: Vec<StateTransition>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    pub snapshot_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValueQuery {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct SignalResponse {
    pub event: String,
    pub value: String,
    pub route: SignalRoute,
    pub recovery_started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_error: Option<String>,
}

pub async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "vm_name": state.vm_name,
        "state": state.controller.state(),
    }))
}

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        vm_name: state.vm_name.clone(),
        status: state.controller.get_status(),
        recent_transitions: state.controller.recent_transitions(RECENT_TRANSITIONS),
    })
}

pub async fn receive_heartbeat(State(state): State<AppState>) -> Json<MessageResponse> {
    state.controller.record_signal();
    let heartbeat = state.controller.get_status().heartbeat;
    Json(MessageResponse::new("Heartbeat received").with_details(json!(heartbeat)))
}

pub async fn heartbeat_status(State(state): State<AppState>) -> Json<HeartbeatStatus> {
    Json(state.controller.get_status().heartbeat)
}

pub async fn start_vm(State(state): State<AppState>) -> Result<Json<MessageResponse>, ApiError> {
    state.controller.request_manual_start().await?;
    Ok(Json(MessageResponse::new(format!(
        "VM '{}' started",
        state.vm_name
    ))))
}

pub async fn stop_vm(State(state): State<AppState>) -> Result<Json<MessageResponse>, ApiError> {
    state.controller.request_manual_stop().await?;
    Ok(Json(MessageResponse::new(format!(
        "VM '{}' stopped",
        state.vm_name
    ))))
}

pub async fn restart_vm(State(state): State<AppState>) -> Result<Json<MessageResponse>, ApiError> {
    state.controller.request_restart().await?;
    Ok(Json(MessageResponse::new(format!(
        "VM '{}' restarted from snapshot '{}'",
        state.vm_name,
        state.checkpoints.reference_name()
    ))))
}

pub async fn list_snapshots(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshots = state.checkpoints.list_checkpoints().await?;
    let reference = state.checkpoints.reference_name();
    Ok(Json(json!({
        "vm_name": state.vm_name,
        "reference": reference,
        "reference_exists": snapshots.iter().any(|name| name == reference),
        "snapshots": snapshots,
    })))
}

pub async fn create_snapshot(
    State(state): State<AppState>,
    Query(query): Query<SnapshotQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    let name = state
        .checkpoints
        .create_checkpoint(query.snapshot_name.as_deref())
        .await?;
    log::info!("Snapshot '{}' created", name);
    Ok(Json(
        MessageResponse::new(format!("Snapshot '{}' created", name))
            .with_details(json!({ "snapshot_name": name })),
    ))
}

pub async fn delete_snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.checkpoints.delete_checkpoint(&name).await?;
    log::info!("Snapshot '{}' deleted", name);
    if name == state.checkpoints.reference_name() {
        log::warn!("The reference snapshot is gone; recoveries will fail until it is recreated");
    }
    Ok(Json(MessageResponse::new(format!(
        "Snapshot '{}' deleted",
        name
    ))))
}

pub async fn enable_monitoring(State(state): State<AppState>) -> Json<MessageResponse> {
    let changed = state.controller.enable_monitoring();
    let message = if changed {
        "Heartbeat monitoring enabled"
    } else {
        "Heartbeat monitoring already enabled"
    };
    Json(MessageResponse::new(message))
}

pub async fn disable_monitoring(State(state): State<AppState>) -> Json<MessageResponse> {
    let changed = state.controller.disable_monitoring();
    let message = if changed {
        "Heartbeat monitoring disabled"
    } else {
        "Heartbeat monitoring already disabled"
    };
    Json(MessageResponse::new(message))
}

pub async fn receive_signal(
    State(state): State<AppState>,
    Path(event): Path<String>,
    Query(query): Query<ValueQuery>,
) -> Result<Json<SignalResponse>, ApiError> {
    validate_hook_name(&event)?;

    // The failure report goes in before any hook runs, so a slow or broken
    // hook cannot hold it back.
    let recovery_started = state.hooks.is_error_event(&event)
        && state
            .controller
            .report_guest_error(&format!("{}: {}", event, query.value));

    let dispatch = state.hooks.handle_signal(&event, &query.value).await?;

    Ok(Json(SignalResponse {
        event,
        value: query.value,
        route: dispatch.route,
        recovery_started,
        hook_error: dispatch.failure,
    }))
}

/// Guests read the bare value, so the body is plain text.
pub async fn poll_resource(
    State(state): State<AppState>,
    Path(resource): Path<String>,
) -> Result<String, ApiError> {
    Ok(state.hooks.poll(&resource).await?.value)
}

pub async fn set_poll_value(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Query(query): Query<ValueQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.hooks.set_poll_value(&resource, &query.value)?;
    Ok(Json(
        MessageResponse::new(format!("Poll value '{}' updated", resource))
            .with_details(json!({ "resource": resource, "value": query.value })),
    ))
}
