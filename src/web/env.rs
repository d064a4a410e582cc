//! Environment editor endpoints.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use super::{ApiError, AppState, api_error, json_body};
use crate::env::EnvUpdateRequest;
use crate::error::EnvFileError;
use crate::state::{ConsoleEvent, LogEntry, LogLevel};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/env", get(list_env).put(update_env))
        .route("/api/env/save", post(save_env))
        .route("/api/env/reload", post(reload_env))
}

fn env_error(err: EnvFileError) -> ApiError {
    let status = match err {
        EnvFileError::NotFound(_) => StatusCode::NOT_FOUND,
        EnvFileError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}

async fn list_env(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let variables = state.env.list().await.map_err(env_error)?;
    Ok(Json(json!({
        "variables": variables,
        "env_file_path": state.env.env_file().display().to_string(),
    })))
}

async fn update_env(
    State(state): State<AppState>,
    body: Result<Json<EnvUpdateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = json_body(body)?;
    let response = state.env.update(request).await.map_err(env_error)?;

    if !response.updated_keys.is_empty() {
        state.store.add_log(LogEntry::new(
            LogLevel::Info,
            "env",
            format!("Environment updated: {}", response.updated_keys.join(", ")),
        ));
        state.store.broadcast(ConsoleEvent::EnvUpdate {
            updated_keys: response.updated_keys.clone(),
        });
    }
    Ok(Json(response))
}

async fn save_env(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let (path, count) = state.env.save().await.map_err(env_error)?;
    state.store.add_log(LogEntry::new(
        LogLevel::Info,
        "env",
        format!("Saved {count} variable(s) to {path}"),
    ));
    Ok(Json(json!({
        "success": true,
        "message": format!("Saved {count} variable(s)"),
        "env_file_path": path,
        "count": count,
    })))
}

async fn reload_env(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let keys = state.env.reload().await.map_err(env_error)?;
    state.store.broadcast(ConsoleEvent::EnvUpdate {
        updated_keys: keys.clone(),
    });
    Ok(Json(json!({
        "success": true,
        "message": format!("Reloaded {} variable(s)", keys.len()),
        "reloaded_keys": keys,
    })))
}
