//! Metrics collector: samples the worker process and tails its log file.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CollectorConfig;
use crate::error::CollectorError;
use crate::state::{LogEntry, LogLevel, RecentActivity, StateStore, WorkerMetrics, WorkerStatus};

/// Worker log file name inside the worker directory.
pub const WORKER_LOG_FILE: &str = "worker.log";

/// Timestamp layout of structured worker log lines.
const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Source of per-process resource samples.
#[async_trait]
pub trait ProcessSampler: Send + Sync {
    async fn sample(&self, pid: u32) -> Result<WorkerMetrics, CollectorError>;
}

/// Samples through `sysinfo`. One `System` is kept across calls so CPU usage
/// is measured between consecutive refreshes.
pub struct SysinfoSampler {
    system: StdMutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: StdMutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSampler for SysinfoSampler {
    async fn sample(&self, pid: u32) -> Result<WorkerMetrics, CollectorError> {
        let mut metrics = {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_memory();
            let target = Pid::from_u32(pid);
            let refresh = ProcessRefreshKind::new().with_cpu().with_memory();
            if !system.refresh_process_specifics(target, refresh) {
                return Err(CollectorError::ProcessNotFound(pid));
            }
            let process = system
                .process(target)
                .ok_or(CollectorError::ProcessNotFound(pid))?;
            process_metrics(
                process.cpu_usage(),
                process.memory(),
                process.virtual_memory(),
                system.total_memory(),
                process.tasks().map_or(0, |tasks| tasks.len() as u32),
            )
        };
        metrics.open_files = open_file_count(pid).await;
        Ok(metrics)
    }
}

/// Build a sample from raw byte counts.
fn process_metrics(cpu: f32, rss: u64, vms: u64, total_memory: u64, threads: u32) -> WorkerMetrics {
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        rss as f64 / total_memory as f64 * 100.0
    };
    WorkerMetrics {
        cpu_percent: f64::from(cpu),
        memory_percent,
        memory_rss: rss,
        memory_vms: vms,
        memory_mb: rss as f64 / (1024.0 * 1024.0),
        open_files: 0,
        threads,
        collected_at: Utc::now(),
    }
}

/// Descriptors under `/proc/<pid>/fd`. Zero where procfs is unavailable.
async fn open_file_count(pid: u32) -> u32 {
    let Ok(mut entries) = tokio::fs::read_dir(format!("/proc/{pid}/fd")).await else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(_)) = entries.next_entry().await {
        count += 1;
    }
    count
}

// ── Log parsing ─────────────────────────────────────────────────────────

/// Parse one worker log line. Recognises `[LEVEL] message` and
/// `YYYY-MM-DD HH:MM:SS - LEVEL - component - message`; anything else is an
/// INFO entry from component `worker`.
pub fn parse_log_line(line: &str, worker_id: &str) -> Option<LogEntry> {
    if line.trim().is_empty() {
        return None;
    }
    let mut entry = LogEntry::new(LogLevel::Info, "worker", line).with_worker(worker_id);

    if let Some(rest) = line.strip_prefix('[') {
        if let Some((level, message)) = rest.split_once(']') {
            if let Ok(level) = level.parse() {
                entry.level = level;
            }
            let message = message.trim();
            if !message.is_empty() {
                entry.message = message.to_string();
            }
        }
    }

    let parts: Vec<&str> = line.splitn(4, " - ").collect();
    if parts.len() >= 3 {
        if let Ok(ts) = NaiveDateTime::parse_from_str(parts[0], LOG_TIMESTAMP_FORMAT) {
            entry.timestamp = ts.and_utc();
            if let Ok(level) = parts[1].parse() {
                entry.level = level;
            }
            entry.component = parts[2].trim().to_string();
            if let Some(message) = parts.get(3) {
                entry.message = message.to_string();
            }
        }
    }

    Some(entry)
}

/// Activity implied by a log message.
#[derive(Debug, Default, PartialEq, Eq)]
struct ActivitySignals {
    completed: bool,
    failed: bool,
    session_started: bool,
    task_started: bool,
}

impl ActivitySignals {
    fn detect(message: &str) -> Self {
        let msg = message.to_lowercase();
        Self {
            completed: msg.contains("task completed") || msg.contains("execution completed"),
            failed: msg.contains("task failed") || msg.contains("execution failed"),
            session_started: msg.contains("session started") || msg.contains("new chat session"),
            task_started: msg.contains("task started") || msg.contains("starting execution"),
        }
    }
}

/// Byte-offset tail over a file that may rotate.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: Option<u64>,
}

impl LogTail {
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: None }
    }

    /// Complete lines appended since the last read. The first successful
    /// open only records end-of-file.
    pub async fn read_new_lines(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let size = file.metadata().await?.len();

        let offset = match self.offset {
            None => {
                self.offset = Some(size);
                return Ok(Vec::new());
            }
            Some(offset) if size < offset => {
                debug!(path = %self.path.display(), "Log file rotated, restarting from the top");
                0
            }
            Some(offset) => offset,
        };

        if size == offset {
            self.offset = Some(offset);
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity((size - offset) as usize);
        file.read_to_end(&mut buf).await?;

        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            self.offset = Some(offset);
            return Ok(Vec::new());
        };
        let complete = &buf[..=last_newline];
        self.offset = Some(offset + complete.len() as u64);

        Ok(String::from_utf8_lossy(complete)
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .collect())
    }
}

// ── Collector ───────────────────────────────────────────────────────────

/// Periodically samples the worker process and ingests its log file.
pub struct MetricsCollector {
    store: Arc<StateStore>,
    sampler: Arc<dyn ProcessSampler>,
    pid: AtomicU32,
    tail: Mutex<LogTail>,
    config: CollectorConfig,
}

impl MetricsCollector {
    pub fn new(
        store: Arc<StateStore>,
        sampler: Arc<dyn ProcessSampler>,
        pid: u32,
        worker_dir: &Path,
        config: CollectorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            sampler,
            pid: AtomicU32::new(pid),
            tail: Mutex::new(LogTail::new(worker_dir.join(WORKER_LOG_FILE))),
            config,
        })
    }

    /// Re-target the collector at another worker process.
    pub fn set_pid(&self, pid: u32) {
        info!(pid, "Metrics collector re-targeted");
        self.pid.store(pid, Ordering::Relaxed);
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Relaxed)
    }

    fn worker_id(&self) -> String {
        format!("worker-{}", self.pid())
    }

    /// Take one resource sample and fold it into the store.
    pub async fn collect_metrics_once(&self) {
        let pid = self.pid();
        if pid == 0 {
            return;
        }

        let metrics = match self.sampler.sample(pid).await {
            Ok(metrics) => metrics,
            Err(e) => {
                self.store.add_log(LogEntry::new(
                    LogLevel::Warning,
                    "metrics",
                    format!("Failed to collect metrics: {e}"),
                ));
                return;
            }
        };

        let worker_id = self.worker_id();
        let cpu = metrics.cpu_percent;
        let threshold = self.config.busy_cpu_threshold;
        self.store.set_worker_metrics(&worker_id, metrics).await;
        self.store
            .update_worker(&worker_id, |w| {
                w.last_heartbeat = Utc::now();
                if cpu > threshold {
                    w.status = WorkerStatus::Busy;
                } else if w.status == WorkerStatus::Busy {
                    w.status = WorkerStatus::Running;
                }
            })
            .await;
    }

    /// Ingest any complete lines appended to the worker log.
    pub async fn tail_logs_once(&self) {
        let lines = match self.tail.lock().await.read_new_lines().await {
            Ok(lines) => lines,
            Err(e) => {
                debug!(error = %e, "Worker log not readable");
                return;
            }
        };

        let worker_id = self.worker_id();
        for line in lines {
            if let Some(entry) = parse_log_line(&line, &worker_id) {
                self.record_activity(&entry).await;
                self.store.add_log(entry);
            }
        }
    }

    async fn record_activity(&self, entry: &LogEntry) {
        let signals = ActivitySignals::detect(&entry.message);
        let worker_id = entry.worker_id.clone().unwrap_or_else(|| self.worker_id());
        let activity = |kind: &str, description: &str| {
            let mut activity = RecentActivity::new(kind, description).with_worker(&worker_id);
            activity.timestamp = entry.timestamp;
            activity
        };

        if signals.completed {
            self.store
                .add_activity(activity("task_completed", "Task completed successfully"))
                .await;
            self.store
                .update_worker(&worker_id, |w| {
                    w.tasks_total += 1;
                    w.tasks_active = w.tasks_active.saturating_sub(1);
                })
                .await;
        }
        if signals.failed {
            self.store.add_activity(activity("task_failed", "Task failed")).await;
            self.store.record_task_failure().await;
        }
        if signals.session_started {
            self.store
                .add_activity(activity("session_started", "New session started"))
                .await;
        }
        if signals.task_started {
            self.store
                .update_worker(&worker_id, |w| w.tasks_active += 1)
                .await;
        }
    }

    /// Start the metrics and log loops. Both stop when `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let metrics = {
            let collector = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(collector.config.metrics_interval);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tick.tick() => collector.collect_metrics_once().await,
                    }
                }
                debug!("Metrics loop stopped");
            })
        };

        let logs = {
            let collector = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(collector.config.log_interval);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tick.tick() => collector.tail_logs_once().await,
                    }
                }
                debug!("Log tail loop stopped");
            })
        };

        vec![metrics, logs]
    }
}
