//! Execution and chat session managers.
//!
//! Three managers share one shape: a [`SessionRegistry`] of live sessions,
//! a cancellation token per session, and a delayed cleanup once the session
//! ends. Each mirrors its sessions into the state store as `SessionInfo`.

pub mod chat;
pub mod direct;
pub mod exec;
pub mod registry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::normalizer::StreamEvent;

pub use chat::{ChatManager, ChatSubscription};
pub use direct::DirectExecManager;
pub use exec::{ExecManager, ExecRequest};
pub use registry::SessionRegistry;

/// `Completed in 1.234s`, rounded to the millisecond.
pub(crate) fn completed_in(started: Instant) -> String {
    let elapsed = Duration::from_millis(started.elapsed().as_millis() as u64);
    format!("Completed in {elapsed:?}")
}

/// A session that produces one ordered stream of execution events.
pub struct StreamSession {
    pub id: String,
    pub started: Instant,
    cancel: CancellationToken,
    done: CancellationToken,
    events: Arc<Mutex<mpsc::Receiver<StreamEvent>>>,
}

impl StreamSession {
    /// New session plus the sender its run task writes to.
    pub fn new(id: String, buffer: usize) -> (Self, mpsc::Sender<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        let session = Self {
            id,
            started: Instant::now(),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            events: Arc::new(Mutex::new(rx)),
        };
        (session, tx)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fired once the run task has emitted its terminal event.
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Claim the event stream. Only one subscriber may read at a time.
    pub fn subscribe(&self) -> Result<EventSubscription, SessionError> {
        let events = Arc::clone(&self.events)
            .try_lock_owned()
            .map_err(|_| SessionError::AlreadySubscribed(self.id.clone()))?;
        Ok(EventSubscription {
            events,
            done: self.done.clone(),
        })
    }
}

/// Exclusive read access to a session's events.
pub struct EventSubscription {
    pub events: OwnedMutexGuard<mpsc::Receiver<StreamEvent>>,
    pub done: CancellationToken,
}

impl EventSubscription {
    /// Next event, or `None` once the stream has ended.
    ///
    /// Buffered events are drained before the done signal is honoured.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        tokio::select! {
            biased;
            event = self.events.recv() => event,
            _ = self.done.cancelled() => self.events.try_recv().ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::EventKind;

    #[tokio::test]
    async fn second_subscriber_is_rejected_until_first_drops() {
        let (session, _tx) = StreamSession::new("exec-1".into(), 4);
        let first = session.subscribe().unwrap();
        assert!(matches!(session.subscribe(), Err(SessionError::AlreadySubscribed(_))));
        drop(first);
        assert!(session.subscribe().is_ok());
    }

    #[tokio::test]
    async fn buffered_events_drain_after_done() {
        let (session, tx) = StreamSession::new("exec-1".into(), 4);
        tx.send(StreamEvent::new(EventKind::Text, "a")).await.unwrap();
        tx.send(StreamEvent::done("fin")).await.unwrap();
        session.done_token().cancel();

        let mut sub = session.subscribe().unwrap();
        assert_eq!(sub.next().await.unwrap().content, "a");
        assert!(sub.next().await.unwrap().is_terminal());
        assert!(sub.next().await.is_none());
    }
}
