//! State endpoints: health, workers, sessions, metrics, logs, activity,
//! control plane, config, and the dashboard event streams.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{ApiError, AppState, EventSender, api_error, named_event, sse_channel};
use crate::monitor;
use crate::state::model::{ComponentHealth, HealthResponse};
use crate::state::{ConsoleEvent, LogEntry, LogFilter, LogLevel, RecentActivity, WorkerStatus};

/// Default page size for `/api/logs`.
const DEFAULT_LOG_LIMIT: usize = 100;

/// Default page size for `/api/activity`.
const DEFAULT_ACTIVITY_LIMIT: usize = 10;

/// Entries replayed when a log stream opens.
const LOG_STREAM_BACKFILL: usize = 50;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/overview", get(overview))
        .route("/api/workers", get(list_workers))
        .route("/api/workers/{id}", get(get_worker))
        .route("/api/workers/{id}/logs", get(worker_logs))
        .route("/api/workers/{id}/restart", post(restart_worker))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/metrics", get(metrics))
        .route("/api/logs", get(logs))
        .route("/api/logs/stream", get(log_stream))
        .route("/api/activity", get(activity))
        .route("/api/control-plane", get(control_plane))
        .route("/api/control-plane/reconnect", post(reconnect_control_plane))
        .route("/api/config", get(config))
        .route("/api/events", get(events))
}

// ── Health & overview ───────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    let control_plane = state.store.control_plane().await;

    let mut components = HashMap::new();
    components.insert(
        "state_store".to_string(),
        ComponentHealth {
            status: "healthy".to_string(),
            message: None,
            checked_at: now,
        },
    );
    components.insert(
        "control_plane".to_string(),
        ComponentHealth {
            status: if control_plane.connected { "healthy" } else { "unhealthy" }.to_string(),
            message: control_plane.error_message.clone(),
            checked_at: control_plane.last_check,
        },
    );
    if state.proxy.is_enabled() {
        let proxy = state.proxy.status().await;
        components.insert(
            "litellm_proxy".to_string(),
            ComponentHealth {
                status: proxy.health_status,
                message: proxy.base_url,
                checked_at: now,
            },
        );
    }

    let status = if control_plane.connected { "healthy" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        uptime: state.store.uptime_formatted(),
        components,
    })
}

async fn overview(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.overview().await)
}

// ── Workers ─────────────────────────────────────────────────────────────

async fn list_workers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.workers().await)
}

async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .worker_detail(&id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Worker not found"))
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn worker_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let filter = LogFilter {
        worker_id: Some(id),
        limit: Some(query.limit.unwrap_or(DEFAULT_LOG_LIMIT)),
        ..Default::default()
    };
    Json(state.store.logs(&filter))
}

async fn restart_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .update_worker(&id, |w| w.status = WorkerStatus::Stopping)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Worker not found"))?;

    info!(worker_id = %id, "Worker restart requested");
    state.store.add_log(
        LogEntry::new(LogLevel::Info, "api", format!("Restart requested for {id}")).with_worker(&id),
    );
    state
        .store
        .add_activity(
            RecentActivity::new("worker_restart", "Worker restart requested").with_worker(&id),
        )
        .await;

    Ok(Json(json!({"status": "restart_requested", "worker_id": id})))
}

// ── Sessions & metrics ──────────────────────────────────────────────────

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.sessions().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .session_detail(&id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Session not found"))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.metrics_snapshot().await)
}

// ── Logs & activity ─────────────────────────────────────────────────────

/// Query string for log endpoints. Unknown levels are ignored.
#[derive(Debug, Default, Deserialize)]
struct LogQuery {
    level: Option<String>,
    component: Option<String>,
    worker_id: Option<String>,
    search: Option<String>,
    limit: Option<usize>,
}

impl LogQuery {
    fn into_filter(self, default_limit: usize) -> LogFilter {
        LogFilter {
            level: self.level.as_deref().and_then(|l| l.parse().ok()),
            component: self.component,
            worker_id: self.worker_id,
            search: self.search,
            since: None,
            limit: Some(self.limit.unwrap_or(default_limit)),
        }
    }
}

async fn logs(State(state): State<AppState>, Query(query): Query<LogQuery>) -> impl IntoResponse {
    Json(state.store.logs(&query.into_filter(DEFAULT_LOG_LIMIT)))
}

async fn log_stream(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    let mut filter = query.into_filter(LOG_STREAM_BACKFILL);
    let (tx, sse) = sse_channel();
    let mut sub = state.store.subscribe();
    let backfill = state.store.logs(&filter);
    filter.limit = None;

    tokio::spawn(async move {
        for entry in &backfill {
            if tx.send(Ok(named_event("log", entry))).await.is_err() {
                state.store.unsubscribe(sub.id);
                return;
            }
        }
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = state.shutdown.cancelled() => break,
                event = sub.rx.recv() => match event {
                    Some(ConsoleEvent::Log(entry)) if filter.matches(&entry) => {
                        if tx.send(Ok(named_event("log", &entry))).await.is_err() {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        state.store.unsubscribe(sub.id);
        debug!(subscriber = sub.id, "Log stream closed");
    });
    sse
}

async fn activity(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    Json(state.store.recent_activity(limit).await)
}

// ── Control plane & config ──────────────────────────────────────────────

async fn control_plane(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.control_plane().await)
}

async fn reconnect_control_plane(State(state): State<AppState>) -> impl IntoResponse {
    let status = monitor::reconnect(
        state.control_plane.as_deref(),
        &state.store,
        state.config.collector.control_plane_timeout,
    )
    .await;
    Json(status)
}

async fn config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.config().await)
}

// ── Dashboard event stream ──────────────────────────────────────────────

async fn send_event(tx: &EventSender, event: &ConsoleEvent) -> bool {
    tx.send(Ok(named_event(event.event_type(), event))).await.is_ok()
}

async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let (tx, sse) = sse_channel();
    let mut sub = state.store.subscribe();
    let overview = ConsoleEvent::Overview(state.store.overview().await);
    let heartbeat_every = state.config.collector.heartbeat_interval;
    info!(subscriber = sub.id, "Dashboard connected");

    tokio::spawn(async move {
        let mut open = send_event(&tx, &overview).await
            && send_event(&tx, &ConsoleEvent::heartbeat()).await;

        let mut heartbeat = tokio::time::interval(heartbeat_every);
        heartbeat.tick().await;
        while open {
            open = tokio::select! {
                _ = tx.closed() => false,
                _ = state.shutdown.cancelled() => false,
                event = sub.rx.recv() => match event {
                    Some(event) => send_event(&tx, &event).await,
                    None => false,
                },
                _ = heartbeat.tick() => send_event(&tx, &ConsoleEvent::heartbeat()).await,
            };
        }
        state.store.unsubscribe(sub.id);
        info!(subscriber = sub.id, "Dashboard disconnected");
    });
    sse
}
