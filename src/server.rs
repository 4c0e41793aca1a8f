//! HTTP server exposing the stream and evaluate endpoints.
//!
//! # Architecture
//!
//! ```text
//! POST /stream/keyboard ──┐
//! POST /stream/mouse    ──┼──▶ Orchestrator
//! POST /evaluate        ──┘
//! GET  /health
//! ```

use crate::domain::events::{KeyEvent, MouseEvent};
use crate::error::SentinelError;
use crate::orchestrator::{EvaluateRequest, KeyboardStreamRequest, MouseStreamRequest, Orchestrator};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Server configuration: just the bind port, everything else (store handles)
/// is assembled into the `Orchestrator` before `run` is called.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>, port: u16) -> Self {
        Self { bind_addr: bind_addr.into(), port }
    }
}

#[derive(Debug, Deserialize)]
struct KeyboardStreamBody {
    session_id: String,
    user_id: String,
    batch_id: i64,
    events: Vec<KeyEvent>,
}

#[derive(Debug, Deserialize)]
struct MouseStreamBody {
    session_id: String,
    user_id: String,
    batch_id: i64,
    events: Vec<MouseEvent>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy", version: crate::VERSION })
}

async fn stream_keyboard(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(body): Json<KeyboardStreamBody>,
) -> Result<axum::http::StatusCode, SentinelError> {
    orchestrator
        .ingest_keyboard(
            KeyboardStreamRequest {
                session_id: body.session_id,
                user_id: body.user_id,
                batch_id: body.batch_id,
                events: body.events,
            },
            now_ms(),
        )
        .await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn stream_mouse(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(body): Json<MouseStreamBody>,
) -> Result<axum::http::StatusCode, SentinelError> {
    orchestrator
        .ingest_mouse(
            MouseStreamRequest {
                session_id: body.session_id,
                user_id: body.user_id,
                batch_id: body.batch_id,
                events: body.events,
            },
            now_ms(),
        )
        .await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn evaluate(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(body): Json<EvaluateRequest>,
) -> Result<Json<crate::domain::decision::EvaluateResponse>, SentinelError> {
    let response = orchestrator.evaluate(body, now_ms()).await?;
    Ok(Json(response))
}

fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stream/keyboard", post(stream_keyboard))
        .route("/stream/mouse", post(stream_mouse))
        .route("/evaluate", post(evaluate))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

/// Starts the HTTP server in the background, returning the bound address
/// and a shutdown handle, mirroring the graceful-shutdown shape used
/// elsewhere in this codebase's tooling.
pub async fn run(config: ServerConfig, orchestrator: Arc<Orchestrator>) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(orchestrator);

    let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Sentinel orchestrator listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
