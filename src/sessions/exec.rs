//! Local executions: run the CLI as a subprocess and stream its output.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{EventSubscription, SessionRegistry, StreamSession, completed_in};
use crate::config::{ConsoleConfig, SessionConfig};
use crate::env::EnvManager;
use crate::error::SessionError;
use crate::normalizer::{NoiseFilter, OutputFormat, OutputStream, StreamEvent, classify_line};
use crate::state::{RecentActivity, SessionInfo, SessionStatus, SessionType, StateStore};

/// Body of `POST /api/exec/start`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    #[serde(default)]
    pub prompt: String,
    /// `auto`, `agent`, or `team`.
    #[serde(default)]
    pub mode: String,
    /// Agent or team id for the `agent`/`team` modes.
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub working_dir: String,
    /// `text` (default) or `json`.
    #[serde(default)]
    pub stream_format: String,
    #[serde(default)]
    pub verbose: bool,
}

/// CLI arguments for a request:
/// `exec [agent|team <id>] <prompt> --yes --stream-format=<fmt> [--local] [--environment=<env>] [-v]`.
pub fn build_args(request: &ExecRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if !request.entity_id.is_empty() && matches!(request.mode.as_str(), "agent" | "team") {
        args.push(request.mode.clone());
        args.push(request.entity_id.clone());
    }
    args.push(request.prompt.clone());
    args.push("--yes".to_string());
    let format = OutputFormat::parse(&request.stream_format);
    args.push(format!("--stream-format={}", format.as_str()));
    if request.local {
        args.push("--local".to_string());
    }
    if !request.environment.is_empty() {
        args.push(format!("--environment={}", request.environment));
    }
    if request.verbose {
        args.push("-v".to_string());
    }
    args
}

fn on_path(name: &str) -> bool {
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
    })
}

/// Locate the CLI binary: the configured name (on `PATH` or as a path), then
/// the usual install locations. Falls back to the configured value.
pub fn resolve_binary(configured: &str) -> String {
    let mut candidates = vec![configured.to_string(), format!("./{configured}")];
    candidates.push(format!("/usr/local/bin/{configured}"));
    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        candidates.push(home.join(".kubiya/bin").join(configured).display().to_string());
    }

    candidates
        .into_iter()
        .find(|candidate| {
            if candidate.contains('/') {
                Path::new(candidate).is_file()
            } else {
                on_path(candidate)
            }
        })
        .unwrap_or_else(|| configured.to_string())
}

enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Manages subprocess executions.
pub struct ExecManager {
    registry: SessionRegistry<StreamSession>,
    store: Arc<StateStore>,
    env: Arc<EnvManager>,
    binary: String,
    worker_dir: PathBuf,
    worker_id: String,
    noise: Arc<NoiseFilter>,
    config: SessionConfig,
}

impl ExecManager {
    pub fn new(store: Arc<StateStore>, env: Arc<EnvManager>, config: &ConsoleConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: SessionRegistry::new(),
            store,
            env,
            binary: resolve_binary(&config.exec_binary),
            worker_dir: config.worker_dir.clone(),
            worker_id: config.worker_id(),
            noise: Arc::new(NoiseFilter::with_extra_patterns(&config.extra_noise_patterns)),
            config: config.sessions.clone(),
        })
    }

    pub fn registry(&self) -> &SessionRegistry<StreamSession> {
        &self.registry
    }

    pub fn session(&self, id: &str) -> Option<Arc<StreamSession>> {
        self.registry.get(id)
    }

    /// Register a new execution and start it in the background.
    pub async fn start(self: &Arc<Self>, request: ExecRequest) -> Result<String, SessionError> {
        if request.prompt.trim().is_empty() {
            return Err(SessionError::MissingField("prompt"));
        }

        let id = format!("exec-{}", Uuid::new_v4());
        let (session, tx) = StreamSession::new(id.clone(), self.config.event_buffer);
        let cancel = session.cancel_token();
        let done = session.done_token();
        let started = session.started;
        self.registry.insert(&id, Arc::new(session));

        let agent = Some(request.entity_id.clone()).filter(|e| !e.is_empty());
        self.store
            .add_session(SessionInfo::new(&id, SessionType::Execution, &self.worker_id).with_agent(agent))
            .await;
        self.store
            .add_activity(
                RecentActivity::new("session_started", "Local execution started")
                    .with_worker(&self.worker_id)
                    .with_session(&id),
            )
            .await;
        info!(execution_id = %id, mode = %request.mode, "Local execution started");

        let manager = Arc::clone(self);
        let run_id = id.clone();
        tokio::spawn(async move {
            let outcome = manager.run(&request, &tx, &cancel).await;
            manager.finish(&run_id, started, outcome, &tx, &done).await;
        });

        Ok(id)
    }

    /// Claim the event stream of an execution.
    pub fn subscribe(&self, id: &str) -> Result<EventSubscription, SessionError> {
        self.registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?
            .subscribe()
    }

    /// Cancel an execution. Safe to call repeatedly.
    pub fn cancel(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.cancel_token().cancel();
        self.schedule_cleanup(id);
        info!(execution_id = %id, "Local execution cancelled");
        Ok(())
    }

    fn schedule_cleanup(&self, id: &str) {
        let store = Arc::clone(&self.store);
        let session_id = id.to_string();
        self.registry
            .schedule_cleanup(id, self.config.exec_cleanup_grace, move || async move {
                store.remove_session(&session_id).await;
            });
    }

    async fn run(
        &self,
        request: &ExecRequest,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let args = build_args(request);
        let format = OutputFormat::parse(&request.stream_format);
        let starting = StreamEvent::status(
            format!("Starting: {} {}", self.binary, args.join(" ")),
            "starting",
        );
        if tx.send(starting).await.is_err() {
            return Outcome::Cancelled;
        }

        let dir = if request.working_dir.is_empty() {
            self.worker_dir.clone()
        } else {
            PathBuf::from(&request.working_dir)
        };

        let mut child = match Command::new(&self.binary)
            .args(&args)
            .current_dir(&dir)
            .envs(self.env.overlay().await)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(binary = %self.binary, error = %e, "Failed to spawn execution");
                return Outcome::Failed(format!("Failed to start execution: {e}"));
            }
        };

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(stdout, OutputStream::Stdout, format, tx, cancel));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(stderr, OutputStream::Stderr, format, tx, cancel));
        }

        let status: Option<std::io::Result<ExitStatus>> = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                None
            }
            status = child.wait() => Some(status),
        };

        for reader in readers {
            let _ = reader.await;
        }

        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        match status {
            Some(Ok(status)) if status.success() => Outcome::Completed,
            Some(Ok(status)) => Outcome::Failed(format!("Execution failed: {status}")),
            Some(Err(e)) => Outcome::Failed(format!("Execution failed: {e}")),
            None => Outcome::Cancelled,
        }
    }

    fn spawn_reader<R>(
        &self,
        reader: R,
        stream: OutputStream,
        format: OutputFormat,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let noise = Arc::clone(&self.noise);
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                let Ok(Some(line)) = line else { break };
                let Some(event) = classify_line(&line, stream, format, &noise) else {
                    continue;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(event) => if sent.is_err() { break },
                }
            }
        })
    }

    /// Record the outcome, emit the single terminal event, and fire `done`.
    async fn finish(
        &self,
        id: &str,
        started: Instant,
        outcome: Outcome,
        tx: &mpsc::Sender<StreamEvent>,
        done: &CancellationToken,
    ) {
        let (event, status) = match outcome {
            Outcome::Completed => (StreamEvent::done(completed_in(started)), SessionStatus::Completed),
            Outcome::Failed(message) => (StreamEvent::error(message), SessionStatus::Failed),
            Outcome::Cancelled => (
                StreamEvent::status("Execution cancelled", "cancelled"),
                SessionStatus::Cancelled,
            ),
        };
        info!(execution_id = %id, status = ?status, "Local execution finished");

        self.store.update_session(id, |s| s.finish(status)).await;
        self.schedule_cleanup(id);
        // Blocks only until a subscriber reads it or cleanup drops the session.
        let _ = tx.send(event).await;
        done.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::normalizer::EventKind;

    fn manager(dir: &Path, binary: &str) -> Arc<ExecManager> {
        let config = ConsoleConfig {
            worker_dir: dir.to_path_buf(),
            exec_binary: binary.to_string(),
            ..Default::default()
        };
        let store = StateStore::new(config.worker_config());
        ExecManager::new(store, Arc::new(EnvManager::new(dir)), &config)
    }

    async fn collect(mut sub: EventSubscription) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), sub.next()).await {
            events.push(event);
        }
        events
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-cli.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[test]
    fn args_for_agent_mode() {
        let request = ExecRequest {
            prompt: "list pods".into(),
            mode: "agent".into(),
            entity_id: "a-1".into(),
            local: true,
            environment: "prod".into(),
            stream_format: "json".into(),
            verbose: true,
            ..Default::default()
        };
        assert_eq!(
            build_args(&request),
            vec![
                "exec",
                "agent",
                "a-1",
                "list pods",
                "--yes",
                "--stream-format=json",
                "--local",
                "--environment=prod",
                "-v"
            ]
        );
    }

    #[test]
    fn args_for_auto_mode_default_format() {
        let request = ExecRequest {
            prompt: "hi".into(),
            mode: "auto".into(),
            entity_id: "ignored".into(),
            ..Default::default()
        };
        assert_eq!(build_args(&request), vec!["exec", "hi", "--yes", "--stream-format=text"]);
    }

    #[test]
    fn unresolvable_binary_falls_back_to_name() {
        assert_eq!(resolve_binary("definitely-not-installed-cli"), "definitely-not-installed-cli");
    }

    #[test]
    fn request_uses_camel_case() {
        let request: ExecRequest =
            serde_json::from_str(r#"{"prompt":"p","entityId":"e","workingDir":"/tmp","streamFormat":"json"}"#)
                .unwrap();
        assert_eq!(request.entity_id, "e");
        assert_eq!(request.working_dir, "/tmp");
        assert_eq!(request.stream_format, "json");
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), "kubiya");
        let err = manager.start(ExecRequest::default()).await.unwrap_err();
        assert!(matches!(err, SessionError::MissingField("prompt")));
        assert!(manager.registry().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_run_streams_then_done() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(
            dir.path(),
            r#"echo "hello world"
echo '{"type":"tool_started","tool_name":"grep","tool_input":{"pattern":"x"}}' 1>&2"#,
        );
        let manager = manager(dir.path(), &binary);
        let id = manager
            .start(ExecRequest {
                prompt: "go".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(id.starts_with("exec-"));

        let events = collect(manager.subscribe(&id).unwrap()).await;
        assert_eq!(events.first().unwrap().status.as_deref(), Some("starting"));
        assert!(events.iter().any(|e| e.kind == EventKind::Text && e.content == "hello world"));
        assert!(events.iter().any(|e| e.kind == EventKind::ToolCall && e.tool_name.as_deref() == Some("grep")));
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Done);
        assert!(last.content.starts_with("Completed in"));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let info = manager.store.session(&id).await.unwrap();
        assert_eq!(info.status, SessionStatus::Completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "exit 3");
        let manager = manager(dir.path(), &binary);
        let id = manager
            .start(ExecRequest {
                prompt: "go".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let events = collect(manager.subscribe(&id).unwrap()).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Error);
        assert!(last.content.starts_with("Execution failed:"));
    }

    #[tokio::test]
    async fn missing_binary_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), "/nonexistent/cli");
        let id = manager
            .start(ExecRequest {
                prompt: "go".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let events = collect(manager.subscribe(&id).unwrap()).await;
        assert!(events.last().unwrap().content.starts_with("Failed to start execution"));
        assert_eq!(manager.store.session(&id).await.unwrap().status, SessionStatus::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn double_cancel_leaves_one_cleanup_timer() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "sleep 30");
        let manager = manager(dir.path(), &binary);
        let id = manager
            .start(ExecRequest {
                prompt: "go".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let sub = manager.subscribe(&id).unwrap();

        manager.cancel(&id).unwrap();
        manager.cancel(&id).unwrap();

        let events = collect(sub).await;
        let last = events.last().unwrap();
        assert_eq!(last.status.as_deref(), Some("cancelled"));
        assert!(manager.session(&id).unwrap().is_done());
        assert_eq!(manager.registry().pending_cleanups(), 1);
        assert!(matches!(manager.cancel("exec-missing"), Err(SessionError::NotFound(_))));
    }
}
