//! Remote executions submitted to the control plane, with their event stream relayed.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::exec::ExecRequest;
use super::{EventSubscription, SessionRegistry, StreamSession, completed_in};
use crate::config::{ConsoleConfig, SessionConfig};
use crate::control_plane::ControlPlaneClient;
use crate::error::{ControlPlaneError, SessionError};
use crate::normalizer::{EventKind, StreamEvent};
use crate::state::{SessionInfo, SessionStatus, SessionType, StateStore};

/// Manages executions that run on the remote control plane.
pub struct DirectExecManager {
    registry: SessionRegistry<StreamSession>,
    store: Arc<StateStore>,
    client: Option<Arc<ControlPlaneClient>>,
    queue_id: String,
    worker_id: String,
    config: SessionConfig,
}

impl DirectExecManager {
    pub fn new(
        store: Arc<StateStore>,
        client: Option<Arc<ControlPlaneClient>>,
        config: &ConsoleConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: SessionRegistry::new(),
            store,
            client,
            queue_id: config.queue_id.clone(),
            worker_id: config.worker_id(),
            config: config.sessions.clone(),
        })
    }

    pub fn registry(&self) -> &SessionRegistry<StreamSession> {
        &self.registry
    }

    /// Submit the execution and start relaying its stream.
    /// Returns the control plane's execution id.
    pub async fn start(self: &Arc<Self>, request: ExecRequest) -> Result<String, SessionError> {
        if request.prompt.trim().is_empty() {
            return Err(SessionError::MissingField("prompt"));
        }
        if request.entity_id.is_empty() {
            return Err(SessionError::MissingField("entityId"));
        }
        let client = self
            .client
            .clone()
            .ok_or(ControlPlaneError::NotConfigured)?;

        let handle = client
            .execute_agent(&request.entity_id, &request.prompt, &self.queue_id)
            .await?;
        let id = handle.id;

        let (session, tx) = StreamSession::new(id.clone(), self.config.event_buffer);
        let cancel = session.cancel_token();
        let done = session.done_token();
        let started = session.started;
        self.registry.insert(&id, Arc::new(session));
        self.store
            .add_session(
                SessionInfo::new(&id, SessionType::Streaming, &self.worker_id)
                    .with_agent(Some(request.entity_id.clone())),
            )
            .await;
        info!(execution_id = %id, agent_id = %request.entity_id, "Remote execution started");

        let manager = Arc::clone(self);
        let relay_id = id.clone();
        tokio::spawn(async move {
            let status = relay(&client, &relay_id, started, &tx, &cancel).await;
            manager.store.update_session(&relay_id, |s| s.finish(status)).await;
            manager.schedule_cleanup(&relay_id);
            done.cancel();
            info!(execution_id = %relay_id, status = ?status, "Remote execution finished");
        });

        Ok(id)
    }

    pub fn subscribe(&self, id: &str) -> Result<EventSubscription, SessionError> {
        self.registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?
            .subscribe()
    }

    /// Cancel a remote execution's relay. Safe to call repeatedly.
    pub fn cancel(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.cancel_token().cancel();
        self.schedule_cleanup(id);
        info!(execution_id = %id, "Remote execution cancelled");
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
}

/// Relay remote events into the session channel, ending with exactly one
/// terminal event. Returns the session's final status.
async fn relay(
    client: &ControlPlaneClient,
    id: &str,
    started: Instant,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> SessionStatus {
    let connected = StreamEvent::status(format!("Connected to execution: {id}"), "connected");
    if tx.send(connected).await.is_err() {
        return SessionStatus::Cancelled;
    }

    let mut stream = match client.stream_execution(id, cancel.clone()).await {
        Ok(stream) => stream,
        Err(ControlPlaneError::Cancelled) => {
            let _ = tx.try_send(StreamEvent::status("Execution cancelled", "cancelled"));
            return SessionStatus::Cancelled;
        }
        Err(e) => {
            warn!(execution_id = %id, error = %e, "Failed to open execution stream");
            let _ = tx.send(StreamEvent::error(e.to_string())).await;
            return SessionStatus::Failed;
        }
    };

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.try_send(StreamEvent::status("Execution cancelled", "cancelled"));
                return SessionStatus::Cancelled;
            }
            item = stream.recv() => item,
        };

        match item {
            Some(Ok(event)) => {
                let terminal = event.is_terminal();
                let failed = event.kind == EventKind::Error;
                if tx.send(event).await.is_err() {
                    return SessionStatus::Cancelled;
                }
                if terminal {
                    return if failed {
                        SessionStatus::Failed
                    } else {
                        SessionStatus::Completed
                    };
                }
            }
            Some(Err(e)) => {
                let _ = tx.send(StreamEvent::error(e.to_string())).await;
                return SessionStatus::Failed;
            }
            None => {
                let _ = tx.send(StreamEvent::done(completed_in(started))).await;
                return SessionStatus::Completed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::Router;
    use axum::routing::{get, post};
    use serde_json::json;

    use super::*;

    /// Control plane that accepts executions but never answers the stream request.
    async fn stalled_control_plane() -> Arc<ControlPlaneClient> {
        let app = Router::new()
            .route(
                "/api/v1/agents/{id}/execute",
                post(|| async { axum::Json(json!({"execution_id": "exec-stalled"})) }),
            )
            .route(
                "/api/v1/executions/{id}/stream",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(120)).await;
                    ""
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Arc::new(ControlPlaneClient::new(
            &format!("http://{addr}"),
            "key".to_string().into(),
        ))
    }

    fn manager(client: Option<Arc<ControlPlaneClient>>) -> Arc<DirectExecManager> {
        let config = ConsoleConfig::default();
        let store = StateStore::new(config.worker_config());
        DirectExecManager::new(store, client, &config)
    }

    #[tokio::test]
    async fn entity_id_is_required() {
        let err = manager(None)
            .start(ExecRequest {
                prompt: "hi".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "entityId is required");
    }

    #[tokio::test]
    async fn missing_client_is_reported() {
        let err = manager(None)
            .start(ExecRequest {
                prompt: "hi".into(),
                entity_id: "agent-1".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ControlPlane(ControlPlaneError::NotConfigured)));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let manager = manager(None);
        assert!(matches!(manager.subscribe("nope"), Err(SessionError::NotFound(_))));
        assert!(matches!(manager.cancel("nope"), Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_while_stream_is_connecting_finishes_session() {
        let manager = manager(Some(stalled_control_plane().await));
        let id = manager
            .start(ExecRequest {
                prompt: "hi".into(),
                entity_id: "agent-1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut sub = manager.subscribe(&id).unwrap();
        let connected = sub.next().await.unwrap();
        assert_eq!(connected.status.as_deref(), Some("connected"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.cancel(&id).unwrap();

        let last = tokio::time::timeout(Duration::from_secs(3), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.status.as_deref(), Some("cancelled"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.registry.get(&id).unwrap().is_done());
        let info = manager.store.session(&id).await.unwrap();
        assert_eq!(info.status, SessionStatus::Cancelled);
    }
}
