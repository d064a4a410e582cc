//! Execution endpoints: catalog pickers, local runs, and remote runs.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    ApiError, AppState, EventSender, client, control_plane_error, data_event, json_body,
    session_error, sse_channel,
};
use crate::control_plane::{CatalogItem, CatalogKind};
use crate::sessions::{EventSubscription, ExecRequest};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/exec/agents", get(list_agents))
        .route("/api/exec/teams", get(list_teams))
        .route("/api/exec/environments", get(list_environments))
        .route("/api/exec/start", post(start_exec))
        .route("/api/exec/stream/{id}", get(stream_exec))
        .route("/api/exec/stop/{id}", post(stop_exec))
        .route("/api/exec/direct/start", post(start_direct))
        .route("/api/exec/direct/stream/{id}", get(stream_direct))
        .route("/api/exec/direct/stop/{id}", post(stop_direct))
}

// ── Catalog ─────────────────────────────────────────────────────────────

async fn list_catalog(
    state: &AppState,
    kind: CatalogKind,
) -> Result<Json<Vec<CatalogItem>>, ApiError> {
    let items = client(state)?
        .list_catalog(kind)
        .await
        .map_err(control_plane_error)?;
    Ok(Json(items))
}

async fn list_agents(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    list_catalog(&state, CatalogKind::Agents).await
}

async fn list_teams(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    list_catalog(&state, CatalogKind::Teams).await
}

async fn list_environments(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    list_catalog(&state, CatalogKind::Environments).await
}

// ── Relay ───────────────────────────────────────────────────────────────

/// Forward session events as `data:` frames until a terminal event, the
/// end of the session, a client disconnect, or shutdown.
fn spawn_relay(mut sub: EventSubscription, tx: EventSender, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = tx.closed() => break,
                _ = shutdown.cancelled() => break,
                event = sub.next() => event,
            };
            let Some(event) = event else { break };
            let terminal = event.is_terminal();
            if tx.send(Ok(data_event(&event))).await.is_err() || terminal {
                break;
            }
        }
        debug!("Execution stream closed");
    });
}

// ── Local executions ────────────────────────────────────────────────────

async fn start_exec(
    State(state): State<AppState>,
    body: Result<Json<ExecRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = json_body(body)?;
    let id = state.exec.start(request).await.map_err(session_error)?;
    Ok(Json(json!({"execution_id": id, "status": "started"})))
}

async fn stream_exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let sub = state.exec.subscribe(&id).map_err(session_error)?;
    let (tx, sse) = sse_channel();
    spawn_relay(sub, tx, state.shutdown.clone());
    Ok(sse)
}

async fn stop_exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.exec.cancel(&id).map_err(session_error)?;
    Ok(Json(json!({"execution_id": id, "status": "cancelled"})))
}

// ── Remote executions ───────────────────────────────────────────────────

async fn start_direct(
    State(state): State<AppState>,
    body: Result<Json<ExecRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = json_body(body)?;
    let id = state.direct.start(request).await.map_err(session_error)?;
    Ok(Json(json!({"execution_id": id, "status": "started"})))
}

async fn stream_direct(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let sub = state.direct.subscribe(&id).map_err(session_error)?;
    let (tx, sse) = sse_channel();
    spawn_relay(sub, tx, state.shutdown.clone());
    Ok(sse)
}

async fn stop_direct(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.direct.cancel(&id).map_err(session_error)?;
    Ok(Json(json!({"execution_id": id, "status": "cancelled"})))
}
