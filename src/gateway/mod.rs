//! HTTP gateway.
//!
//! - `POST /build` streams a build as Server-Sent Events
//! - `POST /stop` stops a sandbox (best effort, always `{ok: true}`)
//! - `GET /health` liveness plus the number of tracked sandboxes
//!
//! The stale-sandbox sweeper runs alongside the server and is cancelled on
//! shutdown.

use crate::build::{BuildOrchestrator, BuildRequest};
use crate::config::schema::AGENT_API_KEY_ENV;
use crate::config::Config;
use crate::error::BuildError;
use crate::sandbox::lifecycle::{LifecycleOptions, SandboxManager};
use crate::sandbox::registry::InMemorySandboxStore;
use crate::sandbox::remote::RemoteSandboxRuntime;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<BuildOrchestrator>,
    pub config: Arc<Config>,
}

impl AppState {
    fn manager(&self) -> &Arc<SandboxManager> {
        self.orchestrator.manager()
    }
}

pub fn router(state: AppState) -> Router {
    let max_body_bytes = state.config.gateway.max_body_bytes;
    Router::new()
        .route("/build", post(handle_build))
        .route("/stop", post(handle_stop))
        .route("/health", get(handle_health))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let runtime = RemoteSandboxRuntime::new(&config.sandbox)?;
    let manager = Arc::new(SandboxManager::new(
        Arc::new(runtime),
        Arc::new(InMemorySandboxStore::new()),
        LifecycleOptions::from(&config),
    ));
    let orchestrator = Arc::new(BuildOrchestrator::new(
        Arc::clone(&manager),
        config.agent.clone(),
    ));

    if config.agent.credential().is_none() {
        tracing::warn!("{AGENT_API_KEY_ENV} is not set; builds will be rejected");
    }

    let cancel = CancellationToken::new();
    let sweeper = Arc::clone(&manager).spawn_sweeper(config.sandbox.sweep_interval(), cancel.clone());

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind gateway to {addr}"))?;
    tracing::info!("Gateway listening on http://{}", listener.local_addr()?);

    let state = AppState {
        orchestrator,
        config: Arc::new(config),
    };
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Gateway server error")?;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!("Sandbox sweeper ended abnormally: {e}");
    }
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

fn error_response(err: &BuildError) -> Response {
    let status = match err {
        BuildError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn parse_json(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

fn string_field(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_build_request(body: &Bytes) -> Result<BuildRequest, BuildError> {
    let body = parse_json(body);
    // Blank prompts are rejected but the text itself is passed on as sent.
    let prompt = body
        .get("prompt")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| BuildError::Validation("prompt is required".to_string()))?;
    Ok(BuildRequest {
        prompt,
        sandbox_id: string_field(&body, "sandboxId"),
    })
}

/// POST /build: start a build and stream its events.
async fn handle_build(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match parse_build_request(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    if state.config.agent.credential().is_none() {
        return error_response(&BuildError::Configuration(format!(
            "{AGENT_API_KEY_ENV} not configured"
        )));
    }

    let events = state.orchestrator.start(request);
    let stream = ReceiverStream::new(events).map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .event(event.kind().as_str())
                .data(event.data().to_string()),
        )
    });
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    );

    ([(header::CONNECTION, "keep-alive")], sse).into_response()
}

/// POST /stop: best-effort stop; the remote outcome is not reported.
async fn handle_stop(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(sandbox_id) = string_field(&parse_json(&body), "sandboxId") else {
        return error_response(&BuildError::Validation("sandboxId is required".to_string()));
    };
    state.manager().stop(&sandbox_id).await;
    Json(json!({ "ok": true })).into_response()
}

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sandboxes": state.manager().store().len(),
    }))
}
