//! Liveness endpoint for the container orchestrator.
//!
//! Healthy means the bootstrap reached READY and the application server
//! accepts connections. Every other state answers 503.

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use bootstrap_core::{BootstrapPhase, CancelToken, PhaseWatch};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

const APP_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub phase: BootstrapPhase,
    pub message: String,
}

#[derive(Clone)]
pub struct HealthState {
    pub phase: PhaseWatch,
    /// `host:port` of the application server; `None` skips the socket check.
    pub app_addr: Option<String>,
}

pub fn health_router(state: HealthState, path: &str) -> Router {
    Router::new()
        .route(path, get(health_check))
        .with_state(state)
}

async fn health_check(State(state): State<HealthState>) -> (StatusCode, Json<HealthCheckResponse>) {
    let phase = state.phase.current();
    debug!(%phase, "health check endpoint called");

    if !phase.is_healthy() {
        return unhealthy(phase, format!("bootstrap is {}", phase));
    }

    if let Some(addr) = &state.app_addr {
        match tokio::time::timeout(APP_CONNECT_TIMEOUT, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return unhealthy(phase, format!("server at {} not accepting connections: {}", addr, e)),
            Err(_) => return unhealthy(phase, format!("server at {} did not answer in time", addr)),
        }
    }

    (
        StatusCode::OK,
        Json(HealthCheckResponse {
            status: "healthy".to_string(),
            phase,
            message: "Hospital service is ready".to_string(),
        }),
    )
}

fn unhealthy(phase: BootstrapPhase, message: String) -> (StatusCode, Json<HealthCheckResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(HealthCheckResponse {
            status: "unhealthy".to_string(),
            phase,
            message,
        }),
    )
}

/// Serve the liveness router until `cancel` fires.
pub async fn serve(listener: TcpListener, router: Router, cancel: CancelToken) -> anyhow::Result<()> {
    info!("🩺 liveness endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Address to probe for the application server. Wildcard binds are checked
/// on loopback.
pub fn app_probe_addr(bind_host: &str, port: u16) -> String {
    let host = match bind_host {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" | "[::]" => "[::1]",
        other => other,
    };
    format!("{}:{}", host, port)
}
