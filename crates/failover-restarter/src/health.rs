//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Default port for health check server.
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Shared state for health check endpoints.
#[derive(Debug, Default)]
pub struct HealthState {
    /// Whether the probe server is listening.
    started: AtomicBool,
    /// Whether the most recent primary lookup succeeded.
    primary_reachable: AtomicBool,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the controller as started.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: controller marked as started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Record the result of the latest primary lookup.
    pub fn record_discovery(&self, reachable: bool) {
        self.primary_reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_primary_reachable(&self) -> bool {
        self.primary_reachable.load(Ordering::SeqCst)
    }
}

/// Address the probe server listens on.
///
/// The kubelet probes the pod IP, so every interface is bound.
pub fn health_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

/// Run the health check HTTP server.
///
/// Runs until the server hits a fatal error; spawn it next to the control loop.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(health_addr(port)).await?;
    serve_health(state, listener).await
}

/// Serve the probe endpoints on an already bound listener.
pub async fn serve_health(state: Arc<HealthState>, listener: TcpListener) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state.clone());

    info!(addr = %listener.local_addr()?, "Health check server listening");

    state.mark_started();

    axum::serve(listener, app).await
}

/// Liveness probe endpoint.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe endpoint.
///
/// Returns 503 until startup completes and while Sentinel cannot name a primary.
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    if !state.is_primary_reachable() {
        debug!("Readiness probe: NOT READY (primary unknown)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    debug!("Readiness probe: OK");
    StatusCode::OK
}
