//! Chat sessions: multi-turn conversations with a remote agent, fanned out
//! to any number of subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SessionRegistry;
use crate::config::{ConsoleConfig, SessionConfig};
use crate::control_plane::ControlPlaneClient;
use crate::error::{ControlPlaneError, SessionError};
use crate::normalizer::{ChatEvent, ChatEventKind, to_chat_event};
use crate::state::{RecentActivity, SessionInfo, SessionStatus, SessionType, StateStore};

/// Capacity of each chat subscriber channel.
const SUBSCRIBER_BUFFER: usize = 100;

/// One live chat.
pub struct ChatSession {
    pub id: String,
    pub agent_id: String,
    cancel: CancellationToken,
    message_count: AtomicU64,
    subscribers: Mutex<Vec<mpsc::Sender<ChatEvent>>>,
}

impl ChatSession {
    fn new(id: String, agent_id: String) -> Self {
        Self {
            id,
            agent_id,
            cancel: CancellationToken::new(),
            message_count: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::Sender<ChatEvent>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_ended(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Offer an event to every subscriber. Full subscribers miss it,
    /// closed ones are dropped.
    fn broadcast(&self, event: ChatEvent) {
        self.subscribers().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(session_id = %self.id, "Chat subscriber full, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Drop every sender so subscribers see the end of their stream.
    fn close_subscribers(&self) {
        self.subscribers().clear();
    }
}

/// A subscriber's end of a chat session.
pub struct ChatSubscription {
    pub rx: mpsc::Receiver<ChatEvent>,
    /// Fired when the session ends.
    pub ended: CancellationToken,
}

/// Manages chat sessions.
pub struct ChatManager {
    registry: SessionRegistry<ChatSession>,
    store: Arc<StateStore>,
    client: Option<Arc<ControlPlaneClient>>,
    queue_id: String,
    worker_id: String,
    config: SessionConfig,
}

impl ChatManager {
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

    pub fn registry(&self) -> &SessionRegistry<ChatSession> {
        &self.registry
    }

    pub fn session(&self, id: &str) -> Option<Arc<ChatSession>> {
        self.registry.get(id)
    }

    /// Open a chat with `agent_id` and return its session id.
    pub async fn start(&self, agent_id: &str) -> Result<String, SessionError> {
        if agent_id.trim().is_empty() {
            return Err(SessionError::MissingField("agent_id"));
        }

        let id = format!("chat-{}", Uuid::new_v4());
        let session = Arc::new(ChatSession::new(id.clone(), agent_id.to_string()));
        self.registry.insert(&id, Arc::clone(&session));
        self.store
            .add_session(
                SessionInfo::new(&id, SessionType::Chat, &self.worker_id)
                    .with_agent(Some(agent_id.to_string())),
            )
            .await;
        self.store
            .add_activity(
                RecentActivity::new("session_started", format!("Chat started with agent {agent_id}"))
                    .with_worker(&self.worker_id)
                    .with_session(&id),
            )
            .await;
        info!(session_id = %id, agent_id = %agent_id, "Chat session started");

        let registry = self.registry.clone();
        let store = Arc::clone(&self.store);
        let grace = self.config.chat_cleanup_grace;
        tokio::spawn(async move {
            session.cancel.cancelled().await;
            session.close_subscribers();
            store
                .update_session(&session.id, |s| s.finish(SessionStatus::Completed))
                .await;
            let session_id = session.id.clone();
            registry.schedule_cleanup(&session.id, grace, move || async move {
                store.remove_session(&session_id).await;
            });
            info!(session_id = %session.id, "Chat session ended");
        });

        Ok(id)
    }

    /// Add a subscriber. An ended session yields an already-closed stream.
    pub fn subscribe(&self, id: &str) -> Result<ChatSubscription, SessionError> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut subscribers = session.subscribers();
        // Checked under the lock so `close_subscribers` cannot miss this sender.
        if !session.is_ended() {
            subscribers.push(tx);
        }
        drop(subscribers);
        Ok(ChatSubscription {
            rx,
            ended: session.cancel.clone(),
        })
    }

    /// Send a user message and start the assistant's turn.
    pub async fn send(&self, id: &str, content: &str) -> Result<(), SessionError> {
        if content.trim().is_empty() {
            return Err(SessionError::MissingField("content"));
        }
        let session = self
            .registry
            .get(id)
            .filter(|s| !s.is_ended())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let client = self
            .client
            .clone()
            .ok_or(ControlPlaneError::NotConfigured)?;

        let count = session.message_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.store
            .update_session(id, |s| s.messages_count = count)
            .await;

        let turn = session.cancel.child_token();
        let queue_id = self.queue_id.clone();
        let content = content.to_string();
        tokio::spawn(async move {
            run_turn(&client, &session, &queue_id, &content, &turn).await;
        });
        Ok(())
    }

    /// End a session and any turn in flight.
    pub fn end(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.cancel.cancel();
        Ok(())
    }
}

/// One assistant turn: execute remotely and relay converted events.
async fn run_turn(
    client: &ControlPlaneClient,
    session: &ChatSession,
    queue_id: &str,
    content: &str,
    turn: &CancellationToken,
) {
    let message_id = format!("msg-{}", Uuid::new_v4().simple());
    let mut start = ChatEvent::new(ChatEventKind::MessageStart).with_message_id(&message_id);
    start.role = Some("assistant".to_string());
    session.broadcast(start);

    let handle = tokio::select! {
        _ = turn.cancelled() => return,
        handle = client.execute_agent(&session.agent_id, content, queue_id) => handle,
    };
    let handle = match handle {
        Ok(handle) => handle,
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "Chat turn failed to start");
            session.broadcast(
                ChatEvent::new(ChatEventKind::Error)
                    .with_message_id(&message_id)
                    .with_content(format!("Failed to start execution: {e}")),
            );
            return;
        }
    };
    debug!(session_id = %session.id, execution_id = %handle.id, "Chat turn executing");

    let mut stream = match client.stream_execution(&handle.id, turn.clone()).await {
        Ok(stream) => stream,
        Err(ControlPlaneError::Cancelled) => return,
        Err(e) => {
            session.broadcast(
                ChatEvent::new(ChatEventKind::Error)
                    .with_message_id(&message_id)
                    .with_content(e.to_string()),
            );
            return;
        }
    };

    loop {
        let item = tokio::select! {
            _ = turn.cancelled() => return,
            item = stream.recv() => item,
        };
        match item {
            Some(Ok(event)) => {
                if let Some(chat) = to_chat_event(&event, &message_id) {
                    session.broadcast(chat);
                }
            }
            Some(Err(e)) => {
                session.broadcast(
                    ChatEvent::new(ChatEventKind::Error)
                        .with_message_id(&message_id)
                        .with_content(e.to_string()),
                );
                return;
            }
            None => {
                session.broadcast(
                    ChatEvent::new(ChatEventKind::MessageEnd).with_message_id(&message_id),
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn manager() -> Arc<ChatManager> {
        let config = ConsoleConfig::default();
        let store = StateStore::new(config.worker_config());
        ChatManager::new(store, None, &config)
    }

    #[tokio::test]
    async fn full_subscriber_misses_events_without_blocking_others() {
        let session = ChatSession::new("chat-1".into(), "agent".into());
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        session.subscribers().push(slow_tx);
        session.subscribers().push(fast_tx);

        for _ in 0..3 {
            session.broadcast(ChatEvent::new(ChatEventKind::ContentDelta).with_content("x"));
        }

        assert_eq!(session.subscriber_count(), 2);
        let mut fast = 0;
        while fast_rx.try_recv().is_ok() {
            fast += 1;
        }
        assert_eq!(fast, 3);
        assert!(slow_rx.try_recv().is_ok());
        assert!(slow_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn end_closes_subscribers_and_marks_session() {
        let manager = manager();
        let id = manager.start("agent-1").await.unwrap();
        let mut sub = manager.subscribe(&id).unwrap();

        manager.end(&id).unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), sub.rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(sub.ended.is_cancelled());

        let mut late = manager.subscribe(&id).unwrap();
        assert!(late.rx.recv().await.is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let info = manager.store.session(&id).await.unwrap();
        assert_eq!(info.status, SessionStatus::Completed);
        assert_eq!(manager.registry.pending_cleanups(), 1);
    }

    #[tokio::test]
    async fn send_validates_session_and_content() {
        let manager = manager();
        assert!(matches!(
            manager.send("chat-missing", "hi").await,
            Err(SessionError::NotFound(_))
        ));

        let id = manager.start("agent-1").await.unwrap();
        assert!(matches!(
            manager.send(&id, "  ").await,
            Err(SessionError::MissingField("content"))
        ));
        assert!(matches!(
            manager.send(&id, "hi").await,
            Err(SessionError::ControlPlane(ControlPlaneError::NotConfigured))
        ));
    }

    #[tokio::test]
    async fn start_requires_agent() {
        assert!(matches!(
            manager().start("").await,
            Err(SessionError::MissingField("agent_id"))
        ));
    }
}
