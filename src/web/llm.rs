//! LLM metadata endpoints.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::debug;

use super::{ApiError, AppState, client, control_plane_error, json_body};
use crate::llm::{ModelTestRequest, ModelTestResponse};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/llm/models", get(models))
        .route("/api/llm/providers", get(providers))
        .route("/api/llm/insights", get(insights))
        .route("/api/llm/default", get(default_model))
        .route("/api/llm/test", post(test_model))
}

async fn models(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let models = client(&state)?
        .list_models()
        .await
        .map_err(control_plane_error)?;
    Ok(Json(models))
}

async fn providers(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    client(&state)?;
    let insights = state
        .llm
        .get_or_fetch(state.control_plane.as_deref())
        .await
        .map_err(control_plane_error)?;
    Ok(Json(insights.providers))
}

async fn insights(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let insights = state
        .llm
        .get_or_fetch(state.control_plane.as_deref())
        .await
        .map_err(control_plane_error)?;
    Ok(Json(insights))
}

async fn default_model(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let model = client(&state)?
        .default_model()
        .await
        .map_err(control_plane_error)?;
    Ok(Json(model))
}

async fn test_model(
    body: Result<Json<ModelTestRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = json_body(body)?;
    debug!(model_id = %request.model_id, "Model test requested");
    Ok(Json(ModelTestResponse::unsupported(&request.model_id)))
}
