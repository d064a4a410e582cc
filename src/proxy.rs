//! Local model proxy status, supervisor-driven control and log access.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Proxy log file name inside the worker directory.
pub const PROXY_LOG_FILE: &str = "litellm_proxy.log";

/// Proxy config file name inside the worker directory.
pub const PROXY_CONFIG_FILE: &str = "litellm_config.yaml";

/// Timeout for the readiness probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle on a running proxy process, owned by whoever launched it.
#[async_trait]
pub trait ProxySupervisor: Send + Sync {
    /// Base URL the proxy serves on, e.g. `http://127.0.0.1:4000`.
    fn base_url(&self) -> String;

    /// Stop the proxy process.
    async fn stop(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// `disabled`, `healthy`, `unhealthy`, or `unknown`.
    pub health_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    pub log_file: String,
}

/// Requested proxy action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyAction {
    Start,
    Stop,
    Restart,
}

/// Outcome of a control action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failed(message: Option<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LangfuseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub host: String,
}

/// Query for reading proxy logs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyLogQuery {
    #[serde(default)]
    pub lines: Option<usize>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyLogs {
    pub logs: Vec<String>,
    pub total: usize,
    pub log_path: String,
    pub truncated: bool,
}

/// Tracks the proxy supervisor and answers status and log queries.
pub struct ProxyManager {
    enabled: bool,
    configured_port: Option<u16>,
    worker_dir: PathBuf,
    supervisor: RwLock<Option<Arc<dyn ProxySupervisor>>>,
    http: reqwest::Client,
}

impl ProxyManager {
    pub fn new(
        enabled: bool,
        configured_port: Option<u16>,
        worker_dir: &Path,
        supervisor: Option<Arc<dyn ProxySupervisor>>,
    ) -> Self {
        Self {
            enabled,
            configured_port,
            worker_dir: worker_dir.to_path_buf(),
            supervisor: RwLock::new(supervisor),
            http: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn log_path(&self) -> PathBuf {
        self.worker_dir.join(PROXY_LOG_FILE)
    }

    /// Current proxy status, probing readiness when a port is known.
    pub async fn status(&self) -> ProxyStatus {
        let mut status = ProxyStatus {
            running: false,
            pid: None,
            port: None,
            base_url: None,
            health_status: "unknown".to_string(),
            config_path: None,
            models: None,
            log_file: self.log_path().display().to_string(),
        };

        if !self.enabled {
            status.health_status = "disabled".to_string();
            return status;
        }

        if let Some(supervisor) = self.supervisor.read().await.as_ref() {
            let base_url = supervisor.base_url();
            status.running = true;
            status.port = port_from_url(&base_url);
            status.base_url = Some(base_url);
        }

        if let Some(port) = self.configured_port.filter(|p| *p > 0) {
            status.port = Some(port);
            status.base_url = Some(format!("http://127.0.0.1:{port}"));
        }

        if let Some(port) = status.port {
            let healthy = self.check_health(port).await;
            status.health_status = if healthy { "healthy" } else { "unhealthy" }.to_string();
            status.running |= healthy;
        }

        let config_path = self.worker_dir.join(PROXY_CONFIG_FILE);
        if let Ok(content) = tokio::fs::read_to_string(&config_path).await {
            status.config_path = Some(config_path.display().to_string());
            match parse_model_names(&content) {
                Ok(models) => status.models = Some(models),
                Err(e) => warn!(path = %config_path.display(), error = %e, "Invalid proxy config"),
            }
        }

        status
    }

    async fn check_health(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/health/readiness");
        match self.http.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Apply a control action. Start and restart need a worker restart.
    pub async fn control(&self, action: ProxyAction) -> ActionResponse {
        match action {
            ProxyAction::Start => ActionResponse::failed(
                Some("Proxy control requires worker restart. Restart the worker with the local proxy enabled.".into()),
                "automated proxy start not supported",
            ),
            ProxyAction::Restart => ActionResponse::failed(
                Some("Proxy restart requires worker restart.".into()),
                "automated proxy restart not supported",
            ),
            ProxyAction::Stop => {
                let mut slot = self.supervisor.write().await;
                let Some(supervisor) = slot.as_ref() else {
                    return ActionResponse::failed(None, "no proxy is running");
                };
                match supervisor.stop().await {
                    Ok(()) => {
                        info!("Local proxy stopped");
                        *slot = None;
                        ActionResponse::ok("Proxy stopped")
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to stop local proxy");
                        ActionResponse::failed(None, e.to_string())
                    }
                }
            }
        }
    }

    /// Read the proxy log with optional search, level, and line-count filters.
    /// Returns `Ok(None)` when no log file exists yet.
    pub async fn read_logs(&self, query: &ProxyLogQuery) -> std::io::Result<Option<ProxyLogs>> {
        let path = self.log_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(filter_log_lines(
            &content,
            query,
            path.display().to_string(),
        )))
    }
}

fn port_from_url(url: &str) -> Option<u16> {
    let after_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = after_scheme.split('/').next()?;
    authority.rsplit_once(':')?.1.parse().ok()
}

fn level_matches(line: &str, level: &str) -> bool {
    match level.to_ascii_uppercase().as_str() {
        "ERROR" => line.contains("ERROR"),
        "WARNING" | "WARN" => line.contains("WARNING") || line.contains("WARN"),
        "INFO" => line.contains("INFO"),
        "DEBUG" => line.contains("DEBUG"),
        _ => true,
    }
}

/// Apply search/level filters, keeping the last `lines` matches (default 100).
pub fn filter_log_lines(content: &str, query: &ProxyLogQuery, log_path: String) -> ProxyLogs {
    let limit = query.lines.filter(|n| *n > 0).unwrap_or(100);
    let search = query
        .search
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase);
    let level = query.level.as_deref().filter(|l| !l.is_empty());

    let matched: Vec<&str> = content
        .lines()
        .filter(|line| !line.is_empty())
        .filter(|line| search.as_ref().is_none_or(|s| line.to_lowercase().contains(s)))
        .filter(|line| level.is_none_or(|l| level_matches(line, l)))
        .collect();

    let start = matched.len().saturating_sub(limit);
    ProxyLogs {
        logs: matched[start..].iter().map(|s| s.to_string()).collect(),
        total: matched.len(),
        log_path,
        truncated: start > 0,
    }
}

#[derive(Debug, Deserialize)]
struct ProxyConfigFile {
    #[serde(default)]
    model_list: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    #[serde(default)]
    model_name: String,
}

/// Model names listed under `model_list:` in the proxy config.
pub fn parse_model_names(content: &str) -> Result<Vec<String>, serde_yaml::Error> {
    let config: ProxyConfigFile = serde_yaml::from_str(content)?;
    Ok(config
        .model_list
        .into_iter()
        .map(|entry| entry.model_name)
        .filter(|name| !name.is_empty())
        .collect())
}
