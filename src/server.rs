// ABOUTME: HTTP server for operators: health status, Prometheus metrics, and prompt intake.
// ABOUTME: POST /groups/{group}/messages routes into a live container or starts a new run.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use corral_agent::{BackendKind, ContainerInput, OutputStatus};
use corral_core::{config::validate_group_folder, metrics, Config, Dispatcher};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const MAX_PROMPT_LENGTH: usize = 64 * 1024;
const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Read-only status for operators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthPayload {
    pub status: String,
    /// Global backend selection
    pub backend: BackendKind,
    /// Backend in effect per known group
    pub groups: BTreeMap<String, BackendKind>,
    /// Groups with a container running now
    pub active: Vec<String>,
}

pub fn health_payload(config: &Config, dispatcher: Option<&Dispatcher>) -> HealthPayload {
    let active = dispatcher.map(|d| d.active_groups()).unwrap_or_default();

    let mut groups: BTreeMap<String, BackendKind> = config
        .groups
        .keys()
        .map(|folder| (folder.clone(), config.backend_for(folder)))
        .collect();
    for folder in &active {
        groups
            .entry(folder.clone())
            .or_insert_with(|| config.backend_for(folder));
    }

    HealthPayload {
        status: "ok".to_string(),
        backend: config.backend.backend_type,
        groups,
        active,
    }
}

#[derive(Debug, Deserialize)]
pub struct IntakeRequest {
    pub prompt: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub chat_jid: Option<String>,
    #[serde(default)]
    pub is_scheduled_task: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IntakeResponse {
    pub success: bool,
    pub message: String,
}

fn reply(status: StatusCode, success: bool, message: impl Into<String>) -> (StatusCode, Json<IntakeResponse>) {
    (
        status,
        Json(IntakeResponse {
            success,
            message: message.into(),
        }),
    )
}

pub fn router(state: ServerState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/groups/{group}/messages", post(intake_handler))
        .with_state(Arc::new(state));

    // Metrics endpoint - renders Prometheus text format
    if let Some(handle) = metrics_handle {
        let metrics_routes = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(Arc::new(handle));
        app = app.merge(metrics_routes);
    }

    app.layer(TraceLayer::new_for_http())
}

/// Serve until the listener fails
pub async fn start_server(config: Arc<Config>, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let metrics_handle =
        metrics::init_metrics().context("Failed to initialize Prometheus metrics")?;

    let addr = format!("{}:{}", config.health.host, config.health.port);
    let app = router(
        ServerState {
            config,
            dispatcher,
        },
        Some(metrics_handle),
    );

    tracing::info!(addr = %addr, "Starting health server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> Json<HealthPayload> {
    Json(health_payload(&state.config, Some(&state.dispatcher)))
}

async fn metrics_handler(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

async fn intake_handler(
    State(state): State<Arc<ServerState>>,
    Path(group): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<IntakeRequest>,
) -> (StatusCode, Json<IntakeResponse>) {
    if let Some(expected_key) = &state.config.health.api_key {
        let provided = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .or(payload.api_key.as_deref());
        if provided != Some(expected_key.as_str()) {
            tracing::warn!(group = %group, "Intake authentication failed");
            metrics::record_error("intake_auth");
            return reply(StatusCode::UNAUTHORIZED, false, "Invalid or missing API key");
        }
    }

    if validate_group_folder(&group).is_err() {
        metrics::record_error("intake_bad_group");
        return reply(StatusCode::BAD_REQUEST, false, "Invalid group name");
    }
    if payload.prompt.trim().is_empty() {
        metrics::record_error("intake_empty_prompt");
        return reply(StatusCode::BAD_REQUEST, false, "Prompt cannot be empty");
    }
    if payload.prompt.len() > MAX_PROMPT_LENGTH {
        metrics::record_error("intake_prompt_too_large");
        return reply(
            StatusCode::BAD_REQUEST,
            false,
            format!("Prompt too large (max {} bytes)", MAX_PROMPT_LENGTH),
        );
    }

    match state.dispatcher.send_message(&group, &payload.prompt).await {
        Ok(true) => {
            tracing::info!(group = %group, "Prompt queued for live session");
            return reply(StatusCode::ACCEPTED, true, "Queued for the running session");
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(group = %group, error = %e, "Failed to queue prompt");
            metrics::record_error("intake_queue");
            return reply(StatusCode::INTERNAL_SERVER_ERROR, false, "Failed to queue prompt");
        }
    }

    let input = ContainerInput {
        prompt: payload.prompt,
        chat_jid: payload.chat_jid,
        is_scheduled_task: payload.is_scheduled_task,
        ..Default::default()
    };
    let dispatcher = Arc::clone(&state.dispatcher);
    let run_group = group.clone();
    tokio::spawn(async move {
        let result = dispatcher
            .run(&run_group, input, |output| {
                tracing::info!(
                    group = %run_group,
                    status = ?output.status,
                    result = ?output.result,
                    "Session output"
                );
            })
            .await;
        match result {
            Ok(outcome) if outcome.status() == OutputStatus::Success => {}
            Ok(outcome) => {
                tracing::warn!(group = %run_group, error = ?outcome.output.error, "Session run failed")
            }
            Err(e) => tracing::error!(group = %run_group, error = %e, "Could not start session run"),
        }
    });

    tracing::info!(group = %group, "Started session run");
    reply(StatusCode::ACCEPTED, true, "Started a new session run")
}
