use anyhow::{Context, Result};
use axum::{
    routing::{delete, get},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::engine::Controller;
use crate::hooks::HookRegistry;
use crate::machine::CheckpointStore;

#[derive(Clone)]
pub struct AppState {
    pub vm_name: String,
    pub controller: Arc<Controller>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub hooks: Arc<HookRegistry>,
}

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(handlers::get_status))
        .route(
            "/heartbeat",
            get(handlers::receive_heartbeat).post(handlers::receive_heartbeat),
        )
        .route("/heartbeat/status", get(handlers::heartbeat_status))
        .route("/vm/start", get(handlers::start_vm).post(handlers::start_vm))
        .route("/vm/stop", get(handlers::stop_vm).post(handlers::stop_vm))
        .route("/vm/restart", get(handlers::restart_vm).post(handlers::restart_vm))
        .route("/snapshots", get(handlers::list_snapshots))
        .route(
            "/snapshot/create",
            get(handlers::create_snapshot).post(handlers::create_snapshot),
        )
        .route("/snapshot/:name", delete(handlers::delete_snapshot))
        .route("/snapshot/delete/:name", get(handlers::delete_snapshot))
        .route(
            "/monitoring/enable",
            get(handlers::enable_monitoring).post(handlers::enable_monitoring),
        )
        .route(
            "/monitoring/disable",
            get(handlers::disable_monitoring).post(handlers::disable_monitoring),
        )
        .route(
            "/revert/enable",
            get(handlers::enable_monitoring).post(handlers::enable_monitoring),
        )
        .route(
            "/revert/disable",
            get(handlers::disable_monitoring).post(handlers::disable_monitoring),
        )
        .route(
            "/signal/:event",
            get(handlers::receive_signal).post(handlers::receive_signal),
        )
        .route("/poll/:resource", get(handlers::poll_resource))
        .route(
            "/poll/:resource/set",
            get(handlers::set_poll_value).post(handlers::set_poll_value),
        );

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves until `shutdown` resolves, then lets in-flight requests finish.
pub async fn serve<F>(state: AppState, addr: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    log::info!("vm-warden API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
