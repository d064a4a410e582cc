//! Diagnostics endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{ApiError, AppState, api_error, named_event, sse_channel};
use crate::diagnostics::{DiagnosticCategory, DiagnosticsReport, OverallHealth};
use crate::state::model::DiagnosticPayload;
use crate::state::{ConsoleEvent, LogEntry, LogLevel, StateStore};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/doctor", get(run_all))
        .route("/api/doctor/stream", get(stream))
        .route("/api/doctor/{category}", get(run_category))
        .route("/api/doctor/fix/{check}", post(fix))
}

/// Log the outcome to the ring and publish it on the bus.
fn record_report(store: &StateStore, report: &DiagnosticsReport) {
    let level = match report.overall {
        OverallHealth::Healthy => LogLevel::Info,
        OverallHealth::Degraded => LogLevel::Warning,
        OverallHealth::Unhealthy => LogLevel::Error,
    };
    let s = &report.summary;
    store.add_log(LogEntry::new(
        level,
        "diagnostics",
        format!(
            "Diagnostics completed: {} passed, {} warnings, {} failed, {} skipped",
            s.passed, s.warnings, s.failed, s.skipped
        ),
    ));
    store.broadcast(ConsoleEvent::DiagnosticComplete(Box::new(report.clone())));
}

async fn run_all(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.diagnostics.run_all().await;
    record_report(&state.store, &report);
    Json(report)
}

async fn run_category(
    State(state): State<AppState>,
    Path(category): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let category: DiagnosticCategory = category
        .parse()
        .map_err(|e: String| api_error(StatusCode::BAD_REQUEST, e))?;
    Ok(Json(state.diagnostics.run_category(category).await))
}

async fn stream(State(state): State<AppState>) -> impl IntoResponse {
    let (tx, sse) = sse_channel();

    tokio::spawn(async move {
        let (check_tx, mut check_rx) = mpsc::channel(16);
        let cancel = state.shutdown.child_token();
        let runner = Arc::clone(&state.diagnostics);
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { runner.run_streaming(check_tx, cancel).await }
        });

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    cancel.cancel();
                    break;
                }
                check = check_rx.recv() => match check {
                    Some(check) => {
                        state
                            .store
                            .broadcast(ConsoleEvent::Diagnostic(DiagnosticPayload::Check(check.clone())));
                        if tx.send(Ok(named_event("diagnostic", &check))).await.is_err() {
                            cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        match run.await {
            Ok(report) if !cancel.is_cancelled() => {
                record_report(&state.store, &report);
                let _ = tx.send(Ok(named_event("diagnostic_complete", &report))).await;
            }
            Ok(_) => debug!("Diagnostics stream abandoned"),
            Err(e) => debug!(error = %e, "Diagnostics task failed"),
        }
    });
    sse
}

async fn fix(Path(check): Path<String>) -> impl IntoResponse {
    let target = match check.as_str() {
        "venv" | "virtualenv" | "virtual-env" => "virtual environment",
        "packages" | "worker-package" => "worker package",
        "pip" => "pip",
        _ => {
            return api_error(StatusCode::BAD_REQUEST, format!("unknown check: {check}"));
        }
    };
    info!(check = %check, "Diagnostics fix requested");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "error": format!("Automated fix for {target} requires worker restart"),
        })),
    )
}
