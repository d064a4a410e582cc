//! Chat endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ApiError, AppState, EventSender, data_event, json_body, session_error, sse_channel};
use crate::error::SessionError;
use crate::normalizer::{ChatEvent, ChatEventKind};
use crate::sessions::ChatSubscription;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/chat/start", post(start_chat))
        .route("/api/chat/stream/{id}", get(stream_chat))
        .route("/api/chat/send", post(send_message))
        .route("/api/chat/end/{id}", post(end_chat))
}

#[derive(Debug, Deserialize)]
struct StartChatRequest {
    #[serde(default, alias = "agentId")]
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    #[serde(default, alias = "sessionId")]
    session_id: String,
    #[serde(default)]
    content: String,
}

async fn start_chat(
    State(state): State<AppState>,
    body: Result<Json<StartChatRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = json_body(body)?;
    let id = state.chat.start(&request.agent_id).await.map_err(session_error)?;
    Ok(Json(json!({"session_id": id, "status": "started"})))
}

async fn stream_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let sub = state.chat.subscribe(&id).map_err(session_error)?;
    let (tx, sse) = sse_channel();
    let shutdown = state.shutdown.clone();

    tokio::spawn(async move {
        let connected = ChatEvent::new(ChatEventKind::Connected).with_content(id.as_str());
        if tx.send(Ok(data_event(&connected))).await.is_err() {
            return;
        }
        relay_chat(sub, &tx, &shutdown).await;
        debug!(session_id = %id, "Chat stream closed");
    });
    Ok(sse)
}

/// Forward chat events until the session ends, the client leaves, or shutdown.
/// Events already queued when the session ends are still delivered.
async fn relay_chat(mut sub: ChatSubscription, tx: &EventSender, shutdown: &CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            event = sub.rx.recv() => event,
            _ = sub.ended.cancelled() => None,
            _ = tx.closed() => None,
            _ = shutdown.cancelled() => None,
        };
        let Some(event) = event else { break };
        if tx.send(Ok(data_event(&event))).await.is_err() {
            break;
        }
    }
}

async fn send_message(
    State(state): State<AppState>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = json_body(body)?;
    if request.session_id.is_empty() {
        return Err(session_error(SessionError::MissingField("session_id")));
    }
    state
        .chat
        .send(&request.session_id, &request.content)
        .await
        .map_err(session_error)?;
    Ok(Json(json!({"success": true, "message": "Message sent"})))
}

async fn end_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.chat.end(&id).map_err(session_error)?;
    Ok(Json(json!({"session_id": id, "status": "ended"})))
}
