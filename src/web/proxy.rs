//! Local model proxy endpoints.

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{ApiError, AppState, api_error, json_body, named_event, sse_channel};
use crate::collector::LogTail;
use crate::proxy::{ActionResponse, LangfuseConfig, ProxyAction, ProxyLogQuery};
use crate::state::{ConsoleEvent, LogEntry, LogLevel};

/// Poll period of the proxy log tail.
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/proxy/status", get(status))
        .route("/api/proxy/control", post(control))
        .route("/api/proxy/logs", get(logs))
        .route("/api/proxy/logs/stream", get(log_stream))
        .route("/api/proxy/langfuse", post(langfuse).put(langfuse))
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    action: ProxyAction,
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.proxy.status().await;
    if state.proxy.is_enabled() {
        let healthy = status.health_status == "healthy";
        state
            .store
            .update_overview(|o| o.litellm_proxy_ok = Some(healthy))
            .await;
    }
    state.store.broadcast(ConsoleEvent::ProxyStatus(status.clone()));
    Json(status)
}

async fn control(
    State(state): State<AppState>,
    body: Result<Json<ControlRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = json_body(body)?;
    let response = state.proxy.control(request.action).await;

    let level = if response.success { LogLevel::Info } else { LogLevel::Warning };
    let outcome = response
        .message
        .clone()
        .or_else(|| response.error.clone())
        .unwrap_or_default();
    state.store.add_log(LogEntry::new(
        level,
        "proxy",
        format!("Proxy {:?} requested: {outcome}", request.action),
    ));
    info!(action = ?request.action, success = response.success, "Proxy control");
    Ok(Json(response))
}

async fn logs(
    State(state): State<AppState>,
    Query(query): Query<ProxyLogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    match state.proxy.read_logs(&query).await {
        Ok(Some(logs)) => Ok(Json(logs)),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Proxy log file not found at {}", state.proxy.log_path().display()),
        )),
        Err(e) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to read proxy log: {e}"),
        )),
    }
}

async fn log_stream(State(state): State<AppState>) -> impl IntoResponse {
    let (tx, sse) = sse_channel();
    let path = state.proxy.log_path();

    tokio::spawn(async move {
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let error = json!({"error": format!("Proxy log file not found at {}", path.display())});
            let _ = tx.send(Ok(named_event("proxy_log_error", &error))).await;
            return;
        }

        let mut tail = LogTail::new(path);
        let mut tick = tokio::time::interval(LOG_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = state.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            let lines = match tail.read_new_lines().await {
                Ok(lines) => lines,
                Err(e) => {
                    let error = json!({"error": e.to_string()});
                    let _ = tx.send(Ok(named_event("proxy_log_error", &error))).await;
                    break;
                }
            };
            for line in lines {
                let frame = json!({"line": line, "timestamp": Utc::now()});
                if tx.send(Ok(named_event("proxy_log", &frame))).await.is_err() {
                    return;
                }
            }
        }
        debug!("Proxy log stream closed");
    });
    sse
}

async fn langfuse(
    State(state): State<AppState>,
    body: Result<Json<LangfuseConfig>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let config = json_body(body)?;
    state.store.add_log(LogEntry::new(
        LogLevel::Info,
        "proxy",
        format!("Langfuse update requested (enabled: {})", config.enabled),
    ));
    Ok(Json(ActionResponse::failed(
        Some("Langfuse configuration changes require a worker restart.".into()),
        "automated Langfuse update not supported",
    )))
}
