use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use worker_console::config::ConsoleConfig;
use worker_console::monitor;
use worker_console::state::{LogEntry, LogLevel, StateStore};
use worker_console::web::{AppState, console_routes};

/// Initialise tracing to stderr, plus a daily rolling file when `log_dir` is set.
fn init_tracing(config: &ConsoleConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "worker-console.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConsoleConfig::from_env()?;
    let _log_guard = init_tracing(&config);

    eprintln!("🛠  Worker Console v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Queue: {}", if config.queue_id.is_empty() { "(none)" } else { config.queue_id.as_str() });
    eprintln!("   Worker PID: {}", config.worker_pid);
    eprintln!("   Worker dir: {}", config.worker_dir.display());
    if config.control_plane_url.is_empty() {
        eprintln!("   Control plane: not configured (remote features disabled)");
    } else {
        eprintln!("   Control plane: {}", config.control_plane_url);
    }
    eprintln!("   Dashboard: http://0.0.0.0:{}/api/overview", config.port);

    let shutdown = CancellationToken::new();
    let store = StateStore::new(config.worker_config());
    let state = AppState::new(config, store.clone(), None, shutdown.clone());
    let config = state.config.clone();

    // ── Background tasks ────────────────────────────────────────────────
    let worker_id = monitor::add_initial_worker(&store, &config).await;
    store.add_log(
        LogEntry::new(LogLevel::Info, "console", "Worker console started").with_worker(&worker_id),
    );

    let mut tasks = state.collector.spawn(shutdown.clone());
    tasks.push(monitor::spawn_control_plane_checker(
        state.control_plane.clone(),
        store.clone(),
        &config.collector,
        shutdown.clone(),
    ));
    tasks.push(monitor::spawn_overview_broadcaster(
        store.clone(),
        config.collector.overview_interval,
        shutdown.clone(),
    ));

    // ── HTTP ────────────────────────────────────────────────────────────
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(port = config.port, "Worker console listening");

    let app = console_routes(state);
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                _ = signal.cancelled() => {}
            }
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("Worker console stopped");
    Ok(())
}
