//! Probe HTTP surface: liveness, readiness and a verbose status document.
//!
//! Handlers only read [`HealthTracker::snapshot`]; status code and body of
//! each response come from the same snapshot.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::health::{ErrorRecord, HealthSnapshot, HealthTracker};
use crate::metrics::Metrics;

/// Errors listed in the status document.
pub const RECENT_ERRORS_SHOWN: usize = 5;

#[derive(Clone)]
pub struct ProbeState {
    pub health: Arc<HealthTracker>,
}

pub fn router(health: Arc<HealthTracker>, metrics: Option<&Metrics>) -> Router {
    let app = Router::new()
        .route("/livez", get(liveness))
        .route("/readyz", get(readiness))
        .route("/health", get(status))
        .with_state(ProbeState { health });

    match metrics {
        Some(m) => app.merge(m.router()),
        None => app,
    }
}

/// Bind `0.0.0.0:port` and serve the probe routes on a background task.
pub async fn spawn_server(port: u16, app: Router) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding health server on port {port}"))?;
    let addr = listener.local_addr()?;
    info!(%addr, "health check server started");
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "health check server stopped");
        }
    });
    Ok((addr, task))
}

async fn liveness(State(state): State<ProbeState>) -> (StatusCode, Json<Value>) {
    let code = if state.health.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "status": "alive" })))
}

async fn readiness(State(state): State<ProbeState>) -> (StatusCode, Json<Value>) {
    let snap = state.health.snapshot();
    let mut body = json!({
        "status": if snap.ready { "ready" } else { "not_ready" },
        "source_stream": snap.source_stream,
        "inference_service": snap.inference_service,
    });
    if snap.broadcast_configured {
        body["broadcast_gateway"] = json!(snap.broadcast_gateway);
    }
    (status_code(snap.ready), Json(body))
}

async fn status(State(state): State<ProbeState>) -> (StatusCode, Json<StatusDoc>) {
    let snap = state.health.snapshot();
    (status_code(snap.healthy), Json(StatusDoc::from_snapshot(&snap)))
}

fn status_code(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Debug, Serialize)]
pub struct StatusDoc {
    pub status: &'static str,
    pub uptime: Uptime,
    pub connections: Connections,
    pub activity: Activity,
    pub errors: Errors,
}

#[derive(Debug, Serialize)]
pub struct Uptime {
    pub started_at: String,
    pub uptime_secs: i64,
}

#[derive(Debug, Serialize)]
pub struct Connections {
    pub source_stream: bool,
    pub inference_service: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast_gateway: Option<bool>,
    pub broadcast_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct Activity {
    pub processed_count: u64,
    pub last_processed: Option<String>,
    pub recent_activity: bool,
}

#[derive(Debug, Serialize)]
pub struct Errors {
    pub count: usize,
    pub recent: Vec<ErrorOut>,
}

#[derive(Debug, Serialize)]
pub struct ErrorOut {
    pub timestamp: String,
    pub message: String,
}

impl From<&ErrorRecord> for ErrorOut {
    fn from(e: &ErrorRecord) -> Self {
        Self {
            timestamp: e.timestamp.to_rfc3339(),
            message: e.message.clone(),
        }
    }
}

impl StatusDoc {
    pub fn from_snapshot(snap: &HealthSnapshot) -> Self {
        Self {
            status: if snap.healthy { "healthy" } else { "unhealthy" },
            uptime: Uptime {
                started_at: snap.started_at.to_rfc3339(),
                uptime_secs: snap.uptime().num_seconds(),
            },
            connections: Connections {
                source_stream: snap.source_stream,
                inference_service: snap.inference_service,
                broadcast_gateway: snap
                    .broadcast_configured
                    .then_some(snap.broadcast_gateway),
                broadcast_enabled: snap.broadcast_configured,
            },
            activity: Activity {
                processed_count: snap.processed_count,
                last_processed: snap.last_processed.map(|t| t.to_rfc3339()),
                recent_activity: snap.recent_activity,
            },
            errors: Errors {
                count: snap.errors.len(),
                recent: snap
                    .recent_errors(RECENT_ERRORS_SHOWN)
                    .iter()
                    .map(ErrorOut::from)
                    .collect(),
            },
        }
    }
}
