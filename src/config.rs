//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;

use crate::error::ConfigError;

/// Prefix shared by every console environment variable.
const ENV_PREFIX: &str = "WORKER_CONSOLE_";

/// Top-level console configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Worker queue this console observes.
    pub queue_id: String,
    /// Deployment flavour reported to the dashboard (e.g. "local", "docker").
    pub deployment_type: String,
    /// Base URL of the remote control plane. Empty disables remote features.
    pub control_plane_url: String,
    /// API key used for control-plane requests.
    pub api_key: SecretString,
    /// Port the HTTP surface binds to.
    pub port: u16,
    /// PID of the observed worker process (defaults to our own PID).
    pub worker_pid: u32,
    /// Directory holding the worker's venv, logs, and `.env` file.
    pub worker_dir: PathBuf,
    /// Whether the worker runs a local model proxy.
    pub enable_local_proxy: bool,
    /// Port of the local model proxy, if known.
    pub proxy_port: Option<u16>,
    /// Model override passed to the worker.
    pub model_override: Option<String>,
    /// Whether the worker runs detached.
    pub daemon_mode: bool,
    /// Worker version string.
    pub version: String,
    /// CLI binary used for local executions. Resolved through [`crate::sessions::exec::resolve_binary`].
    pub exec_binary: String,
    /// Additional noise-filter substrings appended to the defaults.
    pub extra_noise_patterns: Vec<String>,
    /// Directory for rolling console log files. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    /// Periodic task timings.
    pub collector: CollectorConfig,
    /// Session timings and limits.
    pub sessions: SessionConfig,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            queue_id: String::new(),
            deployment_type: "local".to_string(),
            control_plane_url: String::new(),
            api_key: SecretString::from(String::new()),
            port: 8088,
            worker_pid: std::process::id(),
            worker_dir: PathBuf::from("."),
            enable_local_proxy: false,
            proxy_port: None,
            model_override: None,
            daemon_mode: false,
            version: env!("CARGO_PKG_VERSION").to_string(),
            exec_binary: "kubiya".to_string(),
            extra_noise_patterns: Vec::new(),
            log_dir: None,
            collector: CollectorConfig::default(),
            sessions: SessionConfig::default(),
        }
    }
}

impl ConsoleConfig {
    /// Build configuration from `WORKER_CONSOLE_*` environment variables.
    ///
    /// Unset variables fall back to [`Default`]; malformed numbers and
    /// booleans are rejected.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(v) = get("QUEUE_ID") {
            config.queue_id = v;
        }
        if let Some(v) = get("DEPLOYMENT_TYPE") {
            config.deployment_type = v;
        }
        if let Some(v) = get("CONTROL_PLANE_URL") {
            config.control_plane_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("API_KEY") {
            config.api_key = SecretString::from(v);
        }
        if let Some(v) = get("PORT") {
            config.port = parse_value("PORT", &v)?;
        }
        if let Some(v) = get("WORKER_PID") {
            config.worker_pid = parse_value("WORKER_PID", &v)?;
        }
        if let Some(v) = get("WORKER_DIR") {
            config.worker_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ENABLE_LOCAL_PROXY") {
            config.enable_local_proxy = parse_bool("ENABLE_LOCAL_PROXY", &v)?;
        }
        if let Some(v) = get("PROXY_PORT") {
            config.proxy_port = Some(parse_value("PROXY_PORT", &v)?);
        }
        config.model_override = get("MODEL_OVERRIDE");
        if let Some(v) = get("DAEMON_MODE") {
            config.daemon_mode = parse_bool("DAEMON_MODE", &v)?;
        }
        if let Some(v) = get("VERSION") {
            config.version = v;
        }
        if let Some(v) = get("EXEC_BINARY") {
            config.exec_binary = v;
        }
        if let Some(v) = get("NOISE_PATTERNS") {
            config.extra_noise_patterns = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        config.log_dir = get("LOG_DIR").map(PathBuf::from);

        Ok(config)
    }

    /// Public, secret-free view of the configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            queue_id: self.queue_id.clone(),
            deployment_type: self.deployment_type.clone(),
            control_plane_url: self.control_plane_url.clone(),
            enable_local_proxy: self.enable_local_proxy,
            proxy_port: self.proxy_port,
            model_override: self.model_override.clone(),
            daemon_mode: self.daemon_mode,
            worker_dir: self.worker_dir.display().to_string(),
            version: self.version.clone(),
        }
    }

    /// Worker id derived from the observed PID.
    pub fn worker_id(&self) -> String {
        format!("worker-{}", self.worker_pid)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        message: e.to_string(),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

/// Configuration exposed on `/api/config`. Never carries secrets.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerConfig {
    pub queue_id: String,
    pub deployment_type: String,
    pub control_plane_url: String,
    pub enable_local_proxy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    pub daemon_mode: bool,
    pub worker_dir: String,
    pub version: String,
}

/// Timings for the background collectors and monitors.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// How often the worker process is sampled.
    pub metrics_interval: Duration,
    /// How often the worker log file is tailed.
    pub log_interval: Duration,
    /// CPU percentage above which the worker is reported as busy.
    pub busy_cpu_threshold: f64,
    /// How often the control plane is probed.
    pub control_plane_interval: Duration,
    /// Timeout for a single control-plane probe.
    pub control_plane_timeout: Duration,
    /// How often the overview is pushed to subscribers.
    pub overview_interval: Duration,
    /// Heartbeat period on the dashboard event stream.
    pub heartbeat_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(5),
            log_interval: Duration::from_secs(1),
            busy_cpu_threshold: 50.0,
            control_plane_interval: Duration::from_secs(30),
            control_plane_timeout: Duration::from_secs(5),
            overview_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Session timings and limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Grace period before a finished execution session is removed.
    pub exec_cleanup_grace: Duration,
    /// Grace period before an ended chat session is removed.
    pub chat_cleanup_grace: Duration,
    /// Capacity of per-session event channels.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            exec_cleanup_grace: Duration::from_secs(5 * 60),
            chat_cleanup_grace: Duration::from_secs(10 * 60),
            event_buffer: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ConsoleConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.port, 8088);
        assert_eq!(config.worker_pid, std::process::id());
        assert!(config.control_plane_url.is_empty());
        assert!(!config.enable_local_proxy);
    }

    #[test]
    fn reads_prefixed_variables() {
        let config = ConsoleConfig::from_lookup(lookup(&[
            ("WORKER_CONSOLE_QUEUE_ID", "q-1"),
            ("WORKER_CONSOLE_CONTROL_PLANE_URL", "https://cp.example.com/"),
            ("WORKER_CONSOLE_API_KEY", "abc.def.ghi"),
            ("WORKER_CONSOLE_PORT", "9000"),
            ("WORKER_CONSOLE_WORKER_PID", "4242"),
            ("WORKER_CONSOLE_ENABLE_LOCAL_PROXY", "true"),
            ("WORKER_CONSOLE_PROXY_PORT", "4000"),
            ("WORKER_CONSOLE_NOISE_PATTERNS", "foo, bar,,"),
        ]))
        .unwrap();

        assert_eq!(config.queue_id, "q-1");
        assert_eq!(config.control_plane_url, "https://cp.example.com");
        assert_eq!(config.api_key.expose_secret(), "abc.def.ghi");
        assert_eq!(config.port, 9000);
        assert_eq!(config.worker_id(), "worker-4242");
        assert!(config.enable_local_proxy);
        assert_eq!(config.proxy_port, Some(4000));
        assert_eq!(config.extra_noise_patterns, vec!["foo", "bar"]);
    }

    #[test]
    fn rejects_bad_port() {
        let err = ConsoleConfig::from_lookup(lookup(&[("WORKER_CONSOLE_PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "WORKER_CONSOLE_PORT"));
    }

    #[test]
    fn rejects_bad_bool() {
        let err = ConsoleConfig::from_lookup(lookup(&[("WORKER_CONSOLE_DAEMON_MODE", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn worker_config_hides_api_key() {
        let config = ConsoleConfig::from_lookup(lookup(&[("WORKER_CONSOLE_API_KEY", "secret")])).unwrap();
        let json = serde_json::to_string(&config.worker_config()).unwrap();
        assert!(!json.contains("secret"));
    }
}
