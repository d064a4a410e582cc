//! Integration tests for the console HTTP surface.
//!
//! Each test starts the console router on a random port, optionally backed by
//! a fake control plane (another axum router), and talks to it over HTTP.

use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::Router;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use worker_console::config::ConsoleConfig;
use worker_console::monitor;
use worker_console::state::StateStore;
use worker_console::web::{AppState, console_routes};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const REMOTE_EXECUTION_ID: &str = "exec-remote-1";

// ── Fake control plane ──────────────────────────────────────────────────

async fn execution_stream() -> impl IntoResponse {
    let body = format!(
        "event: connected\ndata: {{\"execution_id\": \"{REMOTE_EXECUTION_ID}\"}}\n\n\
         event: message_chunk\ndata: {{\"content\": \"hello from remote\"}}\n\n"
    );
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

async fn start_control_plane() -> String {
    let app = Router::new()
        .route("/api/health", get(|| async { "ok" }))
        .route(
            "/api/v1/agents/{id}/execute",
            post(|| async {
                axum::Json(json!({"execution_id": REMOTE_EXECUTION_ID, "status": "pending"}))
            }),
        )
        .route("/api/v1/executions/{id}/stream", get(execution_stream))
        .route(
            "/api/v1/agents",
            get(|| async {
                axum::Json(json!([
                    {"id": "agent-1", "name": "Agent One", "description": "", "model_id": "gpt-4o"}
                ]))
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// ── Console ─────────────────────────────────────────────────────────────

struct Console {
    base: String,
    state: AppState,
}

async fn start_console(control_plane_url: Option<String>, worker_dir: &Path, exec_binary: Option<PathBuf>) -> Console {
    let mut config = ConsoleConfig {
        queue_id: "q-test".to_string(),
        worker_dir: worker_dir.to_path_buf(),
        control_plane_url: control_plane_url.unwrap_or_default(),
        api_key: "abc.def.ghi".to_string().into(),
        ..Default::default()
    };
    if let Some(binary) = exec_binary {
        config.exec_binary = binary.display().to_string();
    }

    let store = StateStore::new(config.worker_config());
    monitor::add_initial_worker(&store, &config).await;
    let state = AppState::new(config, store, None, CancellationToken::new());
    let app = console_routes(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Console {
        base: format!("http://127.0.0.1:{port}"),
        state,
    }
}

/// Read an SSE body until `needle` shows up, returning everything read.
async fn read_until(response: &mut reqwest::Response, needle: &str) -> String {
    let mut body = String::new();
    while !body.contains(needle) {
        match response.chunk().await.unwrap() {
            Some(bytes) => body.push_str(&String::from_utf8_lossy(&bytes)),
            None => break,
        }
    }
    body
}

// ── State endpoints ─────────────────────────────────────────────────────

#[tokio::test]
async fn overview_and_config_are_served_without_secrets() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let console = start_console(None, dir.path(), None).await;
        let http = reqwest::Client::new();

        let overview: Value = http
            .get(format!("{}/api/overview", console.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(overview["total_workers"], 1);

        let config = http
            .get(format!("{}/api/config", console.base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(config.contains("q-test"));
        assert!(!config.contains("abc.def.ghi"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn restart_marks_worker_stopping_and_logs_it() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let console = start_console(None, dir.path(), None).await;
        let http = reqwest::Client::new();
        let worker_id = format!("worker-{}", std::process::id());

        let missing = http
            .post(format!("{}/api/workers/worker-0/restart", console.base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        let resp = http
            .post(format!("{}/api/workers/{worker_id}/restart", console.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let worker = console.state.store.worker(&worker_id).await.unwrap();
        assert_eq!(serde_json::to_value(worker.status).unwrap(), "stopping");

        let logs: Value = http
            .get(format!("{}/api/logs?component=api&search=restart", console.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(logs.as_array().unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

// ── Request validation ──────────────────────────────────────────────────

#[tokio::test]
async fn malformed_and_incomplete_bodies_are_rejected() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let console = start_console(None, dir.path(), None).await;
        let http = reqwest::Client::new();

        let malformed = http
            .post(format!("{}/api/exec/start", console.base))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), 400);
        let body: Value = malformed.json().await.unwrap();
        assert_eq!(body["error"], "invalid request body");

        let empty = http
            .post(format!("{}/api/exec/start", console.base))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status(), 400);

        let direct = http
            .post(format!("{}/api/exec/direct/start", console.base))
            .json(&json!({"prompt": "hi", "entityId": "agent-1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(direct.status(), 503);

        assert!(console.state.store.sessions().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn doctor_rejects_unknown_category_and_fix() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let console = start_console(None, dir.path(), None).await;
        let http = reqwest::Client::new();

        let category = http
            .get(format!("{}/api/doctor/bogus", console.base))
            .send()
            .await
            .unwrap();
        assert_eq!(category.status(), 400);
        let body: Value = category.json().await.unwrap();
        assert_eq!(body["error"], "invalid category: bogus");

        let unknown_fix = http
            .post(format!("{}/api/doctor/fix/bogus", console.base))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown_fix.status(), 400);

        let venv_fix = http
            .post(format!("{}/api/doctor/fix/venv", console.base))
            .send()
            .await
            .unwrap();
        assert_eq!(venv_fix.status(), 500);
        let body: Value = venv_fix.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("requires worker restart"));
    })
    .await
    .expect("test timed out");
}

// ── Environment ─────────────────────────────────────────────────────────

#[tokio::test]
async fn env_update_masks_secrets_and_saves() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let console = start_console(None, dir.path(), None).await;
        let http = reqwest::Client::new();

        let update: Value = http
            .put(format!("{}/api/env", console.base))
            .json(&json!({"variables": {"CONSOLE_TEST_API_KEY": "sk-1234567890abcdef"}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(update["updated_keys"], json!(["CONSOLE_TEST_API_KEY"]));

        let listing: Value = http
            .get(format!("{}/api/env", console.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let var = listing["variables"]
            .as_array()
            .unwrap()
            .iter()
            .find(|v| v["key"] == "CONSOLE_TEST_API_KEY")
            .unwrap();
        assert_eq!(var["sensitive"], true);
        assert_ne!(var["value"], "sk-1234567890abcdef");

        let save = http
            .post(format!("{}/api/env/save", console.base))
            .send()
            .await
            .unwrap();
        assert_eq!(save.status(), 200);
        let written = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(written.contains("CONSOLE_TEST_API_KEY"));
    })
    .await
    .expect("test timed out");
}

// ── Executions ──────────────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn exec_stream_admits_one_subscriber_and_stops_on_cancel() {
    use std::os::unix::fs::PermissionsExt;

    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-cli");
        std::fs::write(&script, "#!/bin/sh\necho working\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let console = start_console(None, dir.path(), Some(script)).await;
        let http = reqwest::Client::new();

        let started: Value = http
            .post(format!("{}/api/exec/start", console.base))
            .json(&json!({"prompt": "do things"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = started["execution_id"].as_str().unwrap().to_string();
        assert!(id.starts_with("exec-"));

        let mut first = http
            .get(format!("{}/api/exec/stream/{id}", console.base))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), 200);
        let body = read_until(&mut first, "working").await;
        assert!(body.contains("starting"));

        let second = http
            .get(format!("{}/api/exec/stream/{id}", console.base))
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), 409);

        let stop = http
            .post(format!("{}/api/exec/stop/{id}", console.base))
            .send()
            .await
            .unwrap();
        assert_eq!(stop.status(), 200);
        let body = read_until(&mut first, "cancelled").await;
        assert!(body.contains("cancelled"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn direct_execution_relays_remote_stream() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let control_plane = start_control_plane().await;
        let console = start_console(Some(control_plane), dir.path(), None).await;
        let http = reqwest::Client::new();

        let started: Value = http
            .post(format!("{}/api/exec/direct/start", console.base))
            .json(&json!({"prompt": "hi", "entityId": "agent-1"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(started["execution_id"], REMOTE_EXECUTION_ID);

        let body = http
            .get(format!("{}/api/exec/direct/stream/{REMOTE_EXECUTION_ID}", console.base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("Connected to execution: exec-remote-1"));
        assert!(body.contains("hello from remote"));
        assert!(body.contains("Completed in"));

        let session = console.state.store.session(REMOTE_EXECUTION_ID).await.unwrap();
        assert_eq!(session.agent_id.as_deref(), Some("agent-1"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn agent_catalog_is_listed_from_control_plane() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let control_plane = start_control_plane().await;
        let console = start_console(Some(control_plane), dir.path(), None).await;

        let agents: Value = reqwest::get(format!("{}/api/exec/agents", console.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(agents[0]["id"], "agent-1");
        assert_eq!(agents[0]["model"], "gpt-4o");
        assert!(agents[0].get("description").is_none());
    })
    .await
    .expect("test timed out");
}

// ── Chat ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_turn_streams_deltas_and_message_end() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let control_plane = start_control_plane().await;
        let console = start_console(Some(control_plane), dir.path(), None).await;
        let http = reqwest::Client::new();

        let started: Value = http
            .post(format!("{}/api/chat/start", console.base))
            .json(&json!({"agent_id": "agent-1"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = started["session_id"].as_str().unwrap().to_string();

        let mut stream = http
            .get(format!("{}/api/chat/stream/{id}", console.base))
            .send()
            .await
            .unwrap();
        let connected = read_until(&mut stream, "connected").await;
        assert!(connected.contains("connected"));

        let sent = http
            .post(format!("{}/api/chat/send", console.base))
            .json(&json!({"session_id": id, "content": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(sent.status(), 200);
        let sent: Value = sent.json().await.unwrap();
        assert_eq!(sent["success"], true);
        assert_eq!(sent["message"], "Message sent");

        let body = read_until(&mut stream, "message_end").await;
        assert!(body.contains("message_start"));
        assert!(body.contains("content_delta"));
        assert!(body.contains("hello from remote"));

        let ended = http
            .post(format!("{}/api/chat/end/{id}", console.base))
            .send()
            .await
            .unwrap();
        assert_eq!(ended.status(), 200);

        let session = console.state.store.session(&id).await.unwrap();
        assert_eq!(session.messages_count, 1);
    })
    .await
    .expect("test timed out");
}
