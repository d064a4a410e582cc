//! Background monitors: control-plane connectivity, overview pushes, worker
//! registration, and capture of the worker's own output into the log ring.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CollectorConfig, ConsoleConfig};
use crate::control_plane::ControlPlaneClient;
use crate::normalizer::strip_ansi;
use crate::state::{
    AuthStatus, ControlPlaneStatus, LogEntry, LogLevel, RecentActivity, StateStore, WorkerInfo,
};

// ── Control plane ───────────────────────────────────────────────────────

/// Probe the control plane once and store the result.
///
/// The reconnect counter carries over from the previous status.
pub async fn check_control_plane(
    client: Option<&ControlPlaneClient>,
    store: &StateStore,
    timeout: Duration,
) -> ControlPlaneStatus {
    let previous = store.control_plane().await;
    let mut status = ControlPlaneStatus {
        connected: false,
        url: previous.url.clone(),
        latency_ms: 0,
        last_check: Utc::now(),
        last_success: previous.last_success,
        auth_status: AuthStatus::Unknown,
        error_message: None,
        reconnect_count: previous.reconnect_count,
    };

    let Some(client) = client else {
        status.error_message = Some("Control plane URL not configured".to_string());
        store.set_control_plane(status.clone()).await;
        return status;
    };

    match client.probe_health(timeout).await {
        Ok(probe) => {
            status.latency_ms = probe.latency.as_millis() as u64;
            if probe.status == StatusCode::UNAUTHORIZED || probe.status == StatusCode::FORBIDDEN {
                status.auth_status = AuthStatus::Expired;
                status.error_message = Some("Authentication failed".to_string());
            } else if probe.status.as_u16() < 400 {
                status.connected = true;
                status.auth_status = AuthStatus::Valid;
                status.last_success = Some(status.last_check);
            } else {
                status.auth_status = AuthStatus::Error;
                status.error_message = Some(format!("HTTP {}", probe.status.as_u16()));
            }
        }
        Err(e) => {
            debug!(error = %e, "Control plane probe failed");
            status.error_message = Some(e.to_string());
        }
    }

    store.set_control_plane(status.clone()).await;
    status
}

/// Count a manual reconnect and probe immediately.
pub async fn reconnect(
    client: Option<&ControlPlaneClient>,
    store: &StateStore,
    timeout: Duration,
) -> ControlPlaneStatus {
    let mut current = store.control_plane().await;
    current.reconnect_count += 1;
    store.set_control_plane(current).await;
    info!("Control plane reconnect requested");
    check_control_plane(client, store, timeout).await
}

/// Probe the control plane on every tick until `shutdown` fires.
pub fn spawn_control_plane_checker(
    client: Option<Arc<ControlPlaneClient>>,
    store: Arc<StateStore>,
    config: &CollectorConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let interval = config.control_plane_interval;
    let timeout = config.control_plane_timeout;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let status = check_control_plane(client.as_deref(), &store, timeout).await;
                    if !status.connected {
                        warn!(
                            url = %status.url,
                            error = status.error_message.as_deref().unwrap_or(""),
                            "Control plane unreachable"
                        );
                    }
                }
            }
        }
        debug!("Control plane checker stopped");
    })
}

/// Push the overview to subscribers on every tick until `shutdown` fires.
pub fn spawn_overview_broadcaster(
    store: Arc<StateStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => store.broadcast_overview().await,
            }
        }
        debug!("Overview broadcaster stopped");
    })
}

// ── Worker registration ─────────────────────────────────────────────────

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Register the observed worker and record its start.
pub async fn add_initial_worker(store: &StateStore, config: &ConsoleConfig) -> String {
    let worker = WorkerInfo::new(config.worker_pid, &config.queue_id, &config.version, &hostname());
    let worker_id = worker.id.clone();
    store.add_worker(worker).await;
    store
        .add_activity(
            RecentActivity::new(
                "worker_started",
                format!("Worker started (PID: {})", config.worker_pid),
            )
            .with_worker(&worker_id),
        )
        .await;
    worker_id
}

// ── Log capture ─────────────────────────────────────────────────────────

/// Guess a level from free-form output.
pub fn detect_level(line: &str) -> LogLevel {
    let lower = line.to_lowercase();
    if ["error", "exception", "traceback", "critical", "fatal"]
        .iter()
        .any(|w| lower.contains(w))
    {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warning
    } else if lower.contains("debug") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Turn every line from `reader` into a log entry until EOF or shutdown.
pub fn spawn_log_capture<R>(
    reader: R,
    store: Arc<StateStore>,
    component: &str,
    worker_id: &str,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let component = component.to_string();
    let worker_id = worker_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => strip_ansi(&line),
                Ok(None) => break,
                Err(e) => {
                    debug!(component = %component, error = %e, "Log capture read failed");
                    break;
                }
            };
            let message = line.trim();
            if message.is_empty() {
                continue;
            }
            store.add_log(
                LogEntry::new(detect_level(message), &component, message).with_worker(&worker_id),
            );
        }
        debug!(component = %component, "Log capture stopped");
    })
}
