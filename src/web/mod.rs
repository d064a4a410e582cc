//! HTTP surface: JSON endpoints and SSE streams for the dashboard.

mod api;
mod chat;
mod doctor;
mod env;
mod exec;
mod llm;
mod proxy;

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::debug;

use crate::collector::{MetricsCollector, SysinfoSampler};
use crate::config::ConsoleConfig;
use crate::control_plane::ControlPlaneClient;
use crate::diagnostics::DiagnosticsRunner;
use crate::env::EnvManager;
use crate::error::{ControlPlaneError, SessionError};
use crate::llm::{INSIGHTS_TTL, LlmInsightsCache};
use crate::proxy::{ProxyManager, ProxySupervisor};
use crate::sessions::{ChatManager, DirectExecManager, ExecManager};
use crate::state::StateStore;

/// Buffer between an SSE relay task and the response body.
const SSE_BUFFER: usize = 64;

/// Everything the handlers share.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConsoleConfig>,
    pub store: Arc<StateStore>,
    pub control_plane: Option<Arc<ControlPlaneClient>>,
    pub exec: Arc<ExecManager>,
    pub direct: Arc<DirectExecManager>,
    pub chat: Arc<ChatManager>,
    pub diagnostics: Arc<DiagnosticsRunner>,
    pub env: Arc<EnvManager>,
    pub llm: Arc<LlmInsightsCache>,
    pub proxy: Arc<ProxyManager>,
    pub collector: Arc<MetricsCollector>,
    /// Fired on shutdown; every SSE relay ends with it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire up every component from configuration.
    ///
    /// Remote features are disabled when no control-plane URL is set.
    pub fn new(
        config: ConsoleConfig,
        store: Arc<StateStore>,
        proxy_supervisor: Option<Arc<dyn ProxySupervisor>>,
        shutdown: CancellationToken,
    ) -> Self {
        let control_plane = (!config.control_plane_url.is_empty()).then(|| {
            Arc::new(ControlPlaneClient::new(
                &config.control_plane_url,
                config.api_key.clone(),
            ))
        });
        let env = Arc::new(EnvManager::new(&config.worker_dir));
        let collector = MetricsCollector::new(
            Arc::clone(&store),
            Arc::new(SysinfoSampler::new()),
            config.worker_pid,
            &config.worker_dir,
            config.collector.clone(),
        );

        Self {
            exec: ExecManager::new(Arc::clone(&store), Arc::clone(&env), &config),
            direct: DirectExecManager::new(Arc::clone(&store), control_plane.clone(), &config),
            chat: ChatManager::new(Arc::clone(&store), control_plane.clone(), &config),
            diagnostics: Arc::new(DiagnosticsRunner::new(&config)),
            llm: Arc::new(LlmInsightsCache::new(INSIGHTS_TTL)),
            proxy: Arc::new(ProxyManager::new(
                config.enable_local_proxy,
                config.proxy_port,
                &config.worker_dir,
                proxy_supervisor,
            )),
            config: Arc::new(config),
            store,
            control_plane,
            env,
            collector,
            shutdown,
        }
    }
}

/// Build the console router.
pub fn console_routes(state: AppState) -> Router {
    Router::new()
        .merge(api::routes())
        .merge(exec::routes())
        .merge(chat::routes())
        .merge(doctor::routes())
        .merge(env::routes())
        .merge(llm::routes())
        .merge(proxy::routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// JSON error reply: `{"error": "..."}` with a status code.
pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": message.into()})))
}

pub(crate) fn session_error(err: SessionError) -> ApiError {
    let status = match &err {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::AlreadySubscribed(_) => StatusCode::CONFLICT,
        SessionError::MissingField(_) => StatusCode::BAD_REQUEST,
        SessionError::ControlPlane(ControlPlaneError::NotConfigured) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SessionError::ControlPlane(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}

pub(crate) fn control_plane_error(err: ControlPlaneError) -> ApiError {
    let status = match err {
        ControlPlaneError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}

/// Unwrap a JSON body, rejecting malformed input with 400.
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => {
            debug!(error = %rejection, "Rejected request body");
            Err(api_error(StatusCode::BAD_REQUEST, "invalid request body"))
        }
    }
}

pub(crate) fn client(state: &AppState) -> Result<&ControlPlaneClient, ApiError> {
    state
        .control_plane
        .as_deref()
        .ok_or_else(|| control_plane_error(ControlPlaneError::NotConfigured))
}

// ── SSE ─────────────────────────────────────────────────────────────────

pub(crate) type EventSender = mpsc::Sender<Result<Event, Infallible>>;
pub(crate) type EventStream = Sse<KeepAliveStream<ReceiverStream<Result<Event, Infallible>>>>;

/// A channel whose receiving end is the SSE response body.
pub(crate) fn sse_channel() -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(SSE_BUFFER);
    let stream = Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default());
    (tx, stream)
}

fn to_json(payload: &impl Serialize) -> String {
    serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string())
}

/// `event: <name>` frame with a JSON body.
pub(crate) fn named_event(name: &str, payload: &impl Serialize) -> Event {
    Event::default().event(name).data(to_json(payload))
}

/// Unnamed `data:` frame with a JSON body.
pub(crate) fn data_event(payload: &impl Serialize) -> Event {
    Event::default().data(to_json(payload))
}
