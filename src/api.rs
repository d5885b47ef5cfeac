//! Health & status API
//!
//! - GET /health - liveness plus startup gate state
//! - GET /metrics - Prometheus metrics
//! - GET /status - queue lengths and latest local header
//! - GET /pending - records currently held by the engine
//! - POST /outbound - hand a new outbound job to this member

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::{Engine, EngineStatus, PendingRecords};
use crate::error::{EngineError, ErrorKind};
use crate::metrics;
use crate::types::OutboundJob;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ready: bool,
}

#[derive(Serialize)]
pub struct OutboundResponse {
    pub nerve_tx_hash: String,
    pub accepted: bool,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub kind: &'static str,
    pub error: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        ready: state.engine.is_ready(),
    })
}

async fn prometheus_metrics() -> Response {
    match metrics::gather() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

async fn status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.engine.status().await)
}

async fn pending(State(state): State<AppState>) -> Json<PendingRecords> {
    Json(state.engine.pending().await)
}

async fn submit_outbound(State(state): State<AppState>, Json(job): Json<OutboundJob>) -> Response {
    let nerve_tx_hash = job.nerve_tx_hash.clone();
    match state.engine.submit_outbound(job).await {
        Ok(accepted) => (
            if accepted {
                StatusCode::ACCEPTED
            } else {
                StatusCode::OK
            },
            Json(OutboundResponse {
                nerve_tx_hash,
                accepted,
            }),
        )
            .into_response(),
        Err(e) => {
            warn!(nerve_tx_hash = %nerve_tx_hash, error = %e, "Outbound job refused");
            (status_for(&e), Json(error_body(&e))).into_response()
        }
    }
}

fn status_for(error: &EngineError) -> StatusCode {
    match error.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::InsufficientSignatures | ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(error: &EngineError) -> ErrorResponse {
    ErrorResponse {
        kind: error.kind().as_str(),
        error: error.to_string(),
    }
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/pending", get(pending))
        .route("/outbound", post(submit_outbound))
        .with_state(AppState { engine })
}

/// Serve the API until the listener fails
pub async fn start_api_server(addr: SocketAddr, engine: Arc<Engine>) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server started");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}
