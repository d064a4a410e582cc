//! Session registry with per-session cleanup timers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

struct Inner<T> {
    sessions: HashMap<String, Arc<T>>,
    cleanups: HashMap<String, JoinHandle<()>>,
}

/// Sessions keyed by id, plus at most one pending cleanup timer per id.
///
/// Cloning shares the same underlying registry.
pub struct SessionRegistry<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for SessionRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SessionRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sessions: HashMap::new(),
                cleanups: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, id: &str, session: Arc<T>) {
        self.lock().sessions.insert(id.to_string(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.lock().sessions.get(id).cloned()
    }

    /// Remove a session and abort its pending cleanup, if any.
    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        let mut inner = self.lock();
        if let Some(timer) = inner.cleanups.remove(id) {
            timer.abort();
        }
        inner.sessions.remove(id)
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    /// Number of cleanup timers that have not fired yet.
    pub fn pending_cleanups(&self) -> usize {
        self.lock()
            .cleanups
            .values()
            .filter(|timer| !timer.is_finished())
            .count()
    }
}

impl<T: Send + Sync + 'static> SessionRegistry<T> {
    /// Remove `id` after `grace`, then run `on_remove`.
    ///
    /// Any timer already pending for `id` is aborted first, so repeated
    /// calls leave exactly one timer.
    pub fn schedule_cleanup<F, Fut>(&self, id: &str, grace: Duration, on_remove: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        if let Some(previous) = inner.cleanups.remove(id) {
            previous.abort();
            debug!(session_id = %id, "Replaced pending cleanup timer");
        }

        let registry = self.clone();
        let session_id = id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            {
                let mut inner = registry.lock();
                inner.sessions.remove(&session_id);
                inner.cleanups.remove(&session_id);
            }
            debug!(session_id = %session_id, "Session cleaned up");
            on_remove().await;
        });
        inner.cleanups.insert(id.to_string(), timer);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn rescheduling_keeps_one_timer() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        registry.insert("s1", Arc::new(1));

        registry.schedule_cleanup("s1", Duration::from_secs(60), || async {});
        registry.schedule_cleanup("s1", Duration::from_secs(60), || async {});
        tokio::task::yield_now().await;

        assert_eq!(registry.pending_cleanups(), 1);
        assert!(registry.get("s1").is_some());
    }

    #[tokio::test]
    async fn cleanup_removes_session_and_runs_hook() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        registry.insert("s1", Arc::new(1));
        let removed = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let removed = removed.clone();
            registry.schedule_cleanup("s1", Duration::from_millis(20), move || async move {
                removed.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(registry.get("s1").is_none());
        assert_eq!(registry.pending_cleanups(), 0);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn explicit_remove_aborts_timer() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        registry.insert("s1", Arc::new(1));
        registry.schedule_cleanup("s1", Duration::from_secs(60), || async {});

        assert_eq!(*registry.remove("s1").unwrap(), 1);
        assert_eq!(registry.pending_cleanups(), 0);
        assert!(registry.is_empty());
    }
}
