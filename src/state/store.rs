//! State store: the single in-memory source of truth, with a pub/sub bus.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use super::model::{
    ConsoleEvent, ControlPlaneStatus, LogEntry, LogFilter, MetricsSnapshot, RecentActivity,
    SessionDetail, SessionInfo, WorkerDetail, WorkerInfo, WorkerMetrics, WorkerPoolOverview,
    WorkerStatus, format_duration,
};
use super::ring::{DEFAULT_LOG_CAPACITY, RingBuffer};
use crate::config::WorkerConfig;

/// Maximum entries kept in the recent-activity feed.
const MAX_RECENT_ACTIVITY: usize = 50;

/// Buffer size of each subscriber channel.
const SUBSCRIBER_BUFFER: usize = 100;

struct Inner {
    workers: HashMap<String, WorkerInfo>,
    metrics: HashMap<String, WorkerMetrics>,
    sessions: HashMap<String, SessionInfo>,
    config: WorkerConfig,
    overview: WorkerPoolOverview,
    control_plane: ControlPlaneStatus,
    activity: VecDeque<RecentActivity>,
}

impl Inner {
    fn recalculate_overview(&mut self) {
        let o = &mut self.overview;
        o.total_workers = self.workers.len();
        o.active_workers = 0;
        o.idle_workers = 0;
        o.tasks_active = 0;
        o.tasks_processed = 0;

        for worker in self.workers.values() {
            match worker.status {
                WorkerStatus::Running | WorkerStatus::Busy => o.active_workers += 1,
                WorkerStatus::Idle => o.idle_workers += 1,
                _ => {}
            }
            o.tasks_active += u64::from(worker.tasks_active);
            o.tasks_processed += worker.tasks_total;
        }
        o.error_rate = error_rate(o.tasks_failed, o.tasks_processed);
    }
}

fn error_rate(failed: u64, processed: u64) -> f64 {
    if processed == 0 {
        0.0
    } else {
        failed as f64 / processed as f64 * 100.0
    }
}

/// A registered bus subscriber. Dropping the receiver is enough to detach;
/// the store prunes closed channels on the next broadcast.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<ConsoleEvent>,
}

/// In-memory store for workers, metrics, sessions, logs, and activity.
///
/// Every getter returns an owned copy. Mutators publish the changed entity
/// to subscribers with a non-blocking send.
pub struct StateStore {
    inner: RwLock<Inner>,
    logs: RingBuffer<LogEntry>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<ConsoleEvent>>>,
    next_subscriber: AtomicU64,
    started: Instant,
}

impl StateStore {
    /// Create a store for the given worker configuration.
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        Self::with_log_capacity(config, DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(config: WorkerConfig, log_capacity: usize) -> Arc<Self> {
        let start_time = Utc::now();
        let control_plane = ControlPlaneStatus::unknown(&config.control_plane_url);
        Arc::new(Self {
            inner: RwLock::new(Inner {
                workers: HashMap::new(),
                metrics: HashMap::new(),
                sessions: HashMap::new(),
                config,
                overview: WorkerPoolOverview::new(start_time),
                control_plane,
                activity: VecDeque::with_capacity(MAX_RECENT_ACTIVITY),
            }),
            logs: RingBuffer::new(log_capacity),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            started: Instant::now(),
        })
    }

    pub async fn config(&self) -> WorkerConfig {
        self.inner.read().await.config.clone()
    }

    // ── Workers ─────────────────────────────────────────────────────────

    /// Insert or replace a worker.
    pub async fn add_worker(&self, worker: WorkerInfo) {
        info!(worker_id = %worker.id, pid = worker.pid, "Worker registered");
        {
            let mut inner = self.inner.write().await;
            inner.workers.insert(worker.id.clone(), worker.clone());
            inner.recalculate_overview();
        }
        self.broadcast(ConsoleEvent::WorkerUpdate(worker));
    }

    /// Mutate a worker in place. Returns the updated copy, or `None` if unknown.
    pub async fn update_worker<F>(&self, id: &str, f: F) -> Option<WorkerInfo>
    where
        F: FnOnce(&mut WorkerInfo),
    {
        let updated = {
            let mut inner = self.inner.write().await;
            let worker = inner.workers.get_mut(id)?;
            f(worker);
            let updated = worker.clone();
            inner.recalculate_overview();
            updated
        };
        self.broadcast(ConsoleEvent::WorkerUpdate(updated.clone()));
        Some(updated)
    }

    /// Remove a worker and its metrics. Returns whether it existed.
    pub async fn remove_worker(&self, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            let removed = inner.workers.remove(id).is_some();
            inner.metrics.remove(id);
            inner.recalculate_overview();
            removed
        };
        if removed {
            info!(worker_id = %id, "Worker removed");
            self.broadcast(ConsoleEvent::WorkerRemoved {
                worker_id: id.to_string(),
            });
        }
        removed
    }

    pub async fn worker(&self, id: &str) -> Option<WorkerInfo> {
        self.inner.read().await.workers.get(id).cloned()
    }

    /// All workers, ordered by id.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self.inner.read().await.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub async fn worker_detail(&self, id: &str) -> Option<WorkerDetail> {
        let inner = self.inner.read().await;
        let info = inner.workers.get(id)?.clone();
        Some(WorkerDetail {
            info,
            metrics: inner.metrics.get(id).cloned(),
        })
    }

    // ── Metrics ─────────────────────────────────────────────────────────

    /// Store the latest sample for a worker, replacing the previous one.
    pub async fn set_worker_metrics(&self, worker_id: &str, metrics: WorkerMetrics) {
        self.inner
            .write()
            .await
            .metrics
            .insert(worker_id.to_string(), metrics.clone());
        self.broadcast(ConsoleEvent::Metrics {
            worker_id: worker_id.to_string(),
            metrics,
        });
    }

    pub async fn worker_metrics(&self, worker_id: &str) -> Option<WorkerMetrics> {
        self.inner.read().await.metrics.get(worker_id).cloned()
    }

    /// Aggregate of every worker's latest sample.
    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().await;
        let workers = inner.metrics.clone();
        let total_cpu = workers.values().map(|m| m.cpu_percent).sum();
        let total_memory_mb = workers.values().map(|m| m.memory_mb).sum();
        MetricsSnapshot {
            timestamp: Utc::now(),
            workers,
            total_cpu,
            total_memory_mb,
        }
    }

    // ── Sessions ────────────────────────────────────────────────────────

    pub async fn add_session(&self, session: SessionInfo) {
        debug!(session_id = %session.id, session_type = ?session.session_type, "Session added");
        self.inner
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session.clone());
        self.broadcast(ConsoleEvent::Session(session));
    }

    /// Mutate a session in place. Returns the updated copy.
    pub async fn update_session<F>(&self, id: &str, f: F) -> Option<SessionInfo>
    where
        F: FnOnce(&mut SessionInfo),
    {
        let updated = {
            let mut inner = self.inner.write().await;
            let session = inner.sessions.get_mut(id)?;
            f(session);
            session.clone()
        };
        self.broadcast(ConsoleEvent::Session(updated.clone()));
        Some(updated)
    }

    pub async fn remove_session(&self, id: &str) -> bool {
        self.inner.write().await.sessions.remove(id).is_some()
    }

    pub async fn session(&self, id: &str) -> Option<SessionInfo> {
        let mut session = self.inner.read().await.sessions.get(id).cloned()?;
        session.refresh_duration(Utc::now());
        Some(session)
    }

    pub async fn session_detail(&self, id: &str) -> Option<SessionDetail> {
        let info = self.session(id).await?;
        Some(SessionDetail {
            info,
            messages: Vec::new(),
            events: Vec::new(),
        })
    }

    /// All sessions, newest first.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let now = Utc::now();
        let mut sessions: Vec<SessionInfo> = self.inner.read().await.sessions.values().cloned().collect();
        for session in &mut sessions {
            session.refresh_duration(now);
        }
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions
    }

    // ── Control plane ───────────────────────────────────────────────────

    /// Replace the control-plane status wholesale.
    pub async fn set_control_plane(&self, status: ControlPlaneStatus) {
        {
            let mut inner = self.inner.write().await;
            inner.overview.control_plane_ok = status.connected;
            inner.control_plane = status.clone();
        }
        self.broadcast(ConsoleEvent::ControlPlane(status));
    }

    pub async fn control_plane(&self) -> ControlPlaneStatus {
        self.inner.read().await.control_plane.clone()
    }

    // ── Logs & activity ─────────────────────────────────────────────────

    /// Append a log entry and publish it.
    pub fn add_log(&self, entry: LogEntry) {
        self.logs.add(entry.clone());
        self.broadcast(ConsoleEvent::Log(entry));
    }

    pub fn logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.logs.filter(filter)
    }

    /// Up to `n` log entries, newest first.
    pub fn recent_logs(&self, n: usize) -> Vec<LogEntry> {
        self.logs.recent(n)
    }

    /// Prepend an activity item, keeping the feed bounded.
    pub async fn add_activity(&self, activity: RecentActivity) {
        {
            let mut inner = self.inner.write().await;
            inner.activity.push_front(activity.clone());
            inner.activity.truncate(MAX_RECENT_ACTIVITY);
        }
        self.broadcast(ConsoleEvent::Activity(activity));
    }

    /// Up to `n` activity items, newest first.
    pub async fn recent_activity(&self, n: usize) -> Vec<RecentActivity> {
        self.inner.read().await.activity.iter().take(n).cloned().collect()
    }

    // ── Overview ────────────────────────────────────────────────────────

    /// Count a failed task and refresh the error rate.
    pub async fn record_task_failure(&self) {
        let mut inner = self.inner.write().await;
        let o = &mut inner.overview;
        o.tasks_failed += 1;
        o.error_rate = error_rate(o.tasks_failed, o.tasks_processed);
    }

    /// Apply an arbitrary change to the overview.
    pub async fn update_overview<F>(&self, f: F)
    where
        F: FnOnce(&mut WorkerPoolOverview),
    {
        f(&mut self.inner.write().await.overview);
    }

    /// Current overview with uptime stamped at read time.
    pub async fn overview(&self) -> WorkerPoolOverview {
        let mut overview = self.inner.read().await.overview.clone();
        let uptime = self.started.elapsed();
        overview.uptime = uptime.as_secs();
        overview.uptime_formatted = format_duration(uptime);
        overview
    }

    pub fn uptime_formatted(&self) -> String {
        format_duration(self.started.elapsed())
    }

    /// Publish the current overview to every subscriber.
    pub async fn broadcast_overview(&self) {
        let overview = self.overview().await;
        self.broadcast(ConsoleEvent::Overview(overview));
    }

    // ── Pub/sub ─────────────────────────────────────────────────────────

    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<ConsoleEvent>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new bounded subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers().insert(id, tx);
        debug!(subscriber = id, "Subscriber registered");
        Subscription { id, rx }
    }

    /// Deregister a subscriber, closing its channel. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers().remove(&id).is_some() {
            debug!(subscriber = id, "Subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Offer an event to every subscriber without blocking. A full subscriber
    /// misses this event; a closed one is dropped.
    pub fn broadcast(&self, event: ConsoleEvent) {
        let mut subscribers = self.subscribers();
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber = id, event = event.event_type(), "Subscriber full, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsoleConfig;
    use crate::state::model::{LogLevel, SessionStatus, SessionType};

    fn store() -> Arc<StateStore> {
        StateStore::new(ConsoleConfig::default().worker_config())
    }

    fn worker(pid: u32, status: WorkerStatus) -> WorkerInfo {
        let mut w = WorkerInfo::new(pid, "q", "1.0", "host");
        w.status = status;
        w
    }

    #[tokio::test]
    async fn returned_worker_is_a_copy() {
        let store = store();
        store.add_worker(worker(1, WorkerStatus::Running)).await;

        let mut copy = store.worker("worker-1").await.unwrap();
        copy.status = WorkerStatus::Error;
        copy.tasks_total = 99;

        let stored = store.worker("worker-1").await.unwrap();
        assert_eq!(stored.status, WorkerStatus::Running);
        assert_eq!(stored.tasks_total, 0);
    }

    #[tokio::test]
    async fn overview_counts_by_status() {
        let store = store();
        store.add_worker(worker(1, WorkerStatus::Running)).await;
        store.add_worker(worker(2, WorkerStatus::Busy)).await;
        store.add_worker(worker(3, WorkerStatus::Idle)).await;
        store.add_worker(worker(4, WorkerStatus::Error)).await;

        let overview = store.overview().await;
        assert_eq!(overview.total_workers, 4);
        assert_eq!(overview.active_workers, 2);
        assert_eq!(overview.idle_workers, 1);
    }

    #[tokio::test]
    async fn update_and_remove_recalculate_overview() {
        let store = store();
        store.add_worker(worker(1, WorkerStatus::Running)).await;
        store
            .update_worker("worker-1", |w| {
                w.status = WorkerStatus::Idle;
                w.tasks_total = 4;
                w.tasks_active = 1;
            })
            .await
            .unwrap();

        let overview = store.overview().await;
        assert_eq!(overview.active_workers, 0);
        assert_eq!(overview.idle_workers, 1);
        assert_eq!(overview.tasks_processed, 4);
        assert_eq!(overview.tasks_active, 1);

        assert!(store.remove_worker("worker-1").await);
        assert!(!store.remove_worker("worker-1").await);
        assert_eq!(store.overview().await.total_workers, 0);
    }

    #[tokio::test]
    async fn update_unknown_worker_is_none() {
        let store = store();
        assert!(store.update_worker("nope", |_| {}).await.is_none());
    }

    #[tokio::test]
    async fn error_rate_follows_failures() {
        let store = store();
        store.add_worker(worker(1, WorkerStatus::Running)).await;
        store.update_worker("worker-1", |w| w.tasks_total = 4).await;
        store.record_task_failure().await;

        let overview = store.overview().await;
        assert_eq!(overview.tasks_failed, 1);
        assert!((overview.error_rate - 25.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn control_plane_mirrors_into_overview() {
        let store = store();
        let mut status = store.control_plane().await;
        status.connected = true;
        store.set_control_plane(status).await;
        assert!(store.overview().await.control_plane_ok);
    }

    #[tokio::test]
    async fn activity_is_bounded_and_newest_first() {
        let store = store();
        for i in 0..60 {
            store.add_activity(RecentActivity::new("test", format!("item {i}"))).await;
        }
        let recent = store.recent_activity(100).await;
        assert_eq!(recent.len(), MAX_RECENT_ACTIVITY);
        assert_eq!(recent[0].description, "item 59");
        assert_eq!(store.recent_activity(3).await.len(), 3);
    }

    #[tokio::test]
    async fn sessions_update_and_detail() {
        let store = store();
        store
            .add_session(SessionInfo::new("chat-1", SessionType::Chat, "worker-1"))
            .await;
        store
            .update_session("chat-1", |s| {
                s.messages_count += 1;
                s.finish(SessionStatus::Completed);
            })
            .await
            .unwrap();

        let detail = store.session_detail("chat-1").await.unwrap();
        assert_eq!(detail.info.messages_count, 1);
        assert_eq!(detail.info.status, SessionStatus::Completed);
        assert!(detail.messages.is_empty());
        assert!(store.remove_session("chat-1").await);
        assert!(store.session("chat-1").await.is_none());
    }

    #[tokio::test]
    async fn metrics_snapshot_sums_workers() {
        let store = store();
        let sample = |cpu, mem| WorkerMetrics {
            cpu_percent: cpu,
            memory_mb: mem,
            collected_at: Utc::now(),
            ..Default::default()
        };
        store.set_worker_metrics("worker-1", sample(10.0, 100.0)).await;
        store.set_worker_metrics("worker-2", sample(5.5, 20.0)).await;

        let snapshot = store.metrics_snapshot().await;
        assert_eq!(snapshot.workers.len(), 2);
        assert!((snapshot.total_cpu - 15.5).abs() < 1e-9);
        assert!((snapshot.total_memory_mb - 120.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn full_subscriber_does_not_block_others() {
        let store = store();
        let _stalled = store.subscribe();
        let mut reader = store.subscribe();

        for i in 0..(SUBSCRIBER_BUFFER * 2) {
            store.add_log(LogEntry::new(LogLevel::Info, "test", format!("msg {i}")));
            match reader.rx.recv().await {
                Some(ConsoleEvent::Log(entry)) => assert_eq!(entry.message, format!("msg {i}")),
                other => panic!("Expected log event, got {other:?}"),
            }
        }
        assert_eq!(store.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel_once() {
        let store = store();
        let mut sub = store.subscribe();
        store.unsubscribe(sub.id);
        store.unsubscribe(sub.id);
        assert!(sub.rx.recv().await.is_none());
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned() {
        let store = store();
        let sub = store.subscribe();
        drop(sub);
        store.broadcast(ConsoleEvent::heartbeat());
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn worker_events_are_published() {
        let store = store();
        let mut sub = store.subscribe();
        store.add_worker(worker(7, WorkerStatus::Running)).await;
        store.remove_worker("worker-7").await;

        assert!(matches!(sub.rx.recv().await, Some(ConsoleEvent::WorkerUpdate(w)) if w.id == "worker-7"));
        assert!(matches!(
            sub.rx.recv().await,
            Some(ConsoleEvent::WorkerRemoved { worker_id }) if worker_id == "worker-7"
        ));
    }
}
