//! State data model: workers, sessions, logs, activity and bus events.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diagnostics::{DiagnosticCheck, DiagnosticsReport};
use crate::proxy::ProxyStatus;

/// Lifecycle status of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Idle,
    Busy,
    Stopping,
    Error,
    Disconnected,
}

/// A worker tracked by the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub queue_id: String,
    pub status: WorkerStatus,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub tasks_active: u32,
    pub tasks_total: u64,
    pub version: String,
    pub hostname: String,
}

impl WorkerInfo {
    /// A freshly started, running worker.
    pub fn new(pid: u32, queue_id: &str, version: &str, hostname: &str) -> Self {
        let now = Utc::now();
        Self {
            id: format!("worker-{pid}"),
            queue_id: queue_id.to_string(),
            status: WorkerStatus::Running,
            pid,
            started_at: now,
            last_heartbeat: now,
            tasks_active: 0,
            tasks_total: 0,
            version: version.to_string(),
            hostname: hostname.to_string(),
        }
    }
}

/// Latest resource sample for a worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    /// Resident set size in bytes.
    pub memory_rss: u64,
    /// Virtual memory size in bytes.
    pub memory_vms: u64,
    pub memory_percent: f64,
    pub open_files: u32,
    pub threads: u32,
    pub collected_at: DateTime<Utc>,
}

/// Worker with its latest metrics sample.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerDetail {
    #[serde(flatten)]
    pub info: WorkerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<WorkerMetrics>,
}

/// Aggregate view over every tracked worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolOverview {
    pub total_workers: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub tasks_processed: u64,
    pub tasks_active: u64,
    pub tasks_failed: u64,
    /// Failed tasks as a percentage of processed tasks.
    pub error_rate: f64,
    /// Seconds since the console started.
    pub uptime: u64,
    pub uptime_formatted: String,
    pub control_plane_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub litellm_proxy_ok: Option<bool>,
    pub start_time: DateTime<Utc>,
}

impl WorkerPoolOverview {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            total_workers: 0,
            active_workers: 0,
            idle_workers: 0,
            tasks_processed: 0,
            tasks_active: 0,
            tasks_failed: 0,
            error_rate: 0.0,
            uptime: 0,
            uptime_formatted: format_duration(Duration::ZERO),
            control_plane_ok: false,
            litellm_proxy_ok: None,
            start_time,
        }
    }
}

/// Kind of session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Chat,
    Streaming,
    Execution,
}

/// Status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

/// A session as shown on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub worker_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub duration_str: String,
    pub messages_count: u64,
    pub tokens_used: u64,
}

impl SessionInfo {
    /// A new active session started now.
    pub fn new(id: &str, session_type: SessionType, worker_id: &str) -> Self {
        Self {
            id: id.to_string(),
            session_type,
            status: SessionStatus::Active,
            worker_id: worker_id.to_string(),
            agent_id: None,
            agent_name: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: 0,
            duration_str: format_duration(Duration::ZERO),
            messages_count: 0,
            tokens_used: 0,
        }
    }

    pub fn with_agent(mut self, agent_id: Option<String>) -> Self {
        self.agent_id = agent_id;
        self
    }

    /// Move to a terminal status and stamp the end time.
    pub fn finish(&mut self, status: SessionStatus) {
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now);
        self.refresh_duration(now);
    }

    /// Recompute duration against `now` (or the end time once ended).
    pub fn refresh_duration(&mut self, now: DateTime<Utc>) {
        let end = self.ended_at.unwrap_or(now);
        let elapsed = (end - self.started_at).to_std().unwrap_or_default();
        self.duration_ms = elapsed.as_millis() as i64;
        self.duration_str = format_duration(elapsed);
    }
}

/// Session with its recorded messages and events.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub info: SessionInfo,
    pub messages: Vec<serde_json::Value>,
    pub events: Vec<serde_json::Value>,
}

/// Log severity. Serialized upper-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One log record held in the ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<HashMap<String, serde_json::Value>>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.to_string(),
            message: message.into(),
            worker_id: None,
            session_id: None,
            extra: None,
        }
    }

    pub fn with_worker(mut self, worker_id: &str) -> Self {
        self.worker_id = Some(worker_id.to_string());
        self
    }
}

/// Criteria for selecting log entries. Every set field must match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Case-insensitive substring of the message.
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if self.level.is_some_and(|level| entry.level != level) {
            return false;
        }
        if let Some(component) = self.component.as_deref().filter(|c| !c.is_empty()) {
            if entry.component != component {
                return false;
            }
        }
        if let Some(worker_id) = self.worker_id.as_deref().filter(|w| !w.is_empty()) {
            if entry.worker_id.as_deref() != Some(worker_id) {
                return false;
            }
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            if !entry.message.to_lowercase().contains(&search.to_lowercase()) {
                return false;
            }
        }
        if self.since.is_some_and(|since| entry.timestamp < since) {
            return false;
        }
        true
    }
}

/// An entry in the recent-activity feed.
#[derive(Debug, Clone, Serialize)]
pub struct RecentActivity {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl RecentActivity {
    pub fn new(kind: &str, description: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            description: description.into(),
            timestamp: Utc::now(),
            worker_id: None,
            session_id: None,
        }
    }

    pub fn with_worker(mut self, worker_id: &str) -> Self {
        self.worker_id = Some(worker_id.to_string());
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

/// Result of the last control-plane authentication probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Valid,
    Expired,
    Error,
    Unknown,
}

/// Connectivity to the remote control plane. Replaced wholesale on every probe.
#[derive(Debug, Clone, Serialize)]
pub struct ControlPlaneStatus {
    pub connected: bool,
    pub url: String,
    pub latency_ms: u64,
    pub last_check: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    pub auth_status: AuthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub reconnect_count: u32,
}

impl ControlPlaneStatus {
    pub fn unknown(url: &str) -> Self {
        Self {
            connected: false,
            url: url.to_string(),
            latency_ms: 0,
            last_check: Utc::now(),
            last_success: None,
            auth_status: AuthStatus::Unknown,
            error_message: None,
            reconnect_count: 0,
        }
    }
}

/// Point-in-time aggregate of every worker's latest sample.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub workers: HashMap<String, WorkerMetrics>,
    pub total_cpu: f64,
    pub total_memory_mb: f64,
}

/// Health of one component on `/api/health`.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Body of `/api/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime: String,
    pub components: HashMap<String, ComponentHealth>,
}

/// Payload of a `diagnostic` event: a single check in progress or a finished report.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DiagnosticPayload {
    Check(DiagnosticCheck),
    Report(Box<DiagnosticsReport>),
}

/// Event published on the state bus. Serialized as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ConsoleEvent {
    WorkerUpdate(WorkerInfo),
    WorkerRemoved { worker_id: String },
    Metrics {
        worker_id: String,
        metrics: WorkerMetrics,
    },
    Log(LogEntry),
    Session(SessionInfo),
    Activity(RecentActivity),
    ControlPlane(ControlPlaneStatus),
    Overview(WorkerPoolOverview),
    Heartbeat { timestamp: DateTime<Utc> },
    Diagnostic(DiagnosticPayload),
    DiagnosticComplete(Box<DiagnosticsReport>),
    EnvUpdate { updated_keys: Vec<String> },
    ProxyStatus(ProxyStatus),
}

impl ConsoleEvent {
    /// Wire name used as the SSE `event:` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            ConsoleEvent::WorkerUpdate(_) => "worker_update",
            ConsoleEvent::WorkerRemoved { .. } => "worker_removed",
            ConsoleEvent::Metrics { .. } => "metrics",
            ConsoleEvent::Log(_) => "log",
            ConsoleEvent::Session(_) => "session",
            ConsoleEvent::Activity(_) => "activity",
            ConsoleEvent::ControlPlane(_) => "control_plane",
            ConsoleEvent::Overview(_) => "overview",
            ConsoleEvent::Heartbeat { .. } => "heartbeat",
            ConsoleEvent::Diagnostic(_) => "diagnostic",
            ConsoleEvent::DiagnosticComplete(_) => "diagnostic_complete",
            ConsoleEvent::EnvUpdate { .. } => "env_update",
            ConsoleEvent::ProxyStatus(_) => "proxy_status",
        }
    }

    pub fn heartbeat() -> Self {
        ConsoleEvent::Heartbeat {
            timestamp: Utc::now(),
        }
    }
}

/// Human-friendly duration: `45s`, `3m 12s`, `2h 5m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64().round() as u64;
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_duration_ranges() {
        assert_eq!(format_duration(Duration::from_millis(44_600)), "45s");
        assert_eq!(format_duration(Duration::from_secs(192)), "3m 12s");
        assert_eq!(format_duration(Duration::from_secs(2 * 3600 + 5 * 60 + 30)), "2h 5m");
    }

    #[test]
    fn log_level_parses_aliases() {
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("ERR".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(serde_json::to_string(&LogLevel::Warning).unwrap(), "\"WARNING\"");
    }

    #[test]
    fn filter_matches_all_set_fields() {
        let entry = LogEntry::new(LogLevel::Error, "metrics", "Disk FULL on /var").with_worker("worker-1");

        let filter = LogFilter {
            level: Some(LogLevel::Error),
            worker_id: Some("worker-1".into()),
            search: Some("disk full".into()),
            ..Default::default()
        };
        assert!(filter.matches(&entry));

        let wrong_component = LogFilter {
            component: Some("worker".into()),
            ..Default::default()
        };
        assert!(!wrong_component.matches(&entry));
    }

    #[test]
    fn event_serializes_with_type_and_data() {
        let event = ConsoleEvent::WorkerRemoved {
            worker_id: "worker-9".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "worker_removed");
        assert_eq!(json["data"]["worker_id"], "worker-9");
        assert_eq!(event.event_type(), "worker_removed");
    }

    #[test]
    fn session_finish_sets_end_and_duration() {
        let mut session = SessionInfo::new("exec-1", SessionType::Execution, "worker-1");
        session.started_at = Utc::now() - chrono::Duration::seconds(90);
        session.finish(SessionStatus::Completed);
        assert!(session.ended_at.is_some());
        assert_eq!(session.duration_str, "1m 30s");
        assert!(session.status.is_terminal());
    }
}
