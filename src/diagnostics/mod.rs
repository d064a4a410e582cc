//! Diagnostics: an ordered set of environment and connectivity checks.
//!
//! Each check is bounded by its own timeout and reports its own outcome; a
//! failing or hung check never affects its neighbours.

pub mod checks;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ConsoleConfig;

pub use checks::{format_bytes, mask_api_key};

/// Upper bound on a single check.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticStatus {
    Pass,
    Fail,
    Warning,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCategory {
    Python,
    Packages,
    Connectivity,
    Config,
    Process,
}

impl FromStr for DiagnosticCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(DiagnosticCategory::Python),
            "packages" => Ok(DiagnosticCategory::Packages),
            "connectivity" => Ok(DiagnosticCategory::Connectivity),
            "config" => Ok(DiagnosticCategory::Config),
            "process" => Ok(DiagnosticCategory::Process),
            other => Err(format!("invalid category: {other}")),
        }
    }
}

/// Result of one check.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticCheck {
    pub name: String,
    pub category: DiagnosticCategory,
    pub status: DiagnosticStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub skipped: usize,
}

impl DiagnosticSummary {
    pub fn from_checks(checks: &[DiagnosticCheck]) -> Self {
        let mut summary = Self {
            total: checks.len(),
            ..Default::default()
        };
        for check in checks {
            match check.status {
                DiagnosticStatus::Pass => summary.passed += 1,
                DiagnosticStatus::Fail => summary.failed += 1,
                DiagnosticStatus::Warning => summary.warnings += 1,
                DiagnosticStatus::Skip => summary.skipped += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallHealth {
    /// Any failure is unhealthy; otherwise any warning is degraded.
    pub fn from_summary(summary: &DiagnosticSummary) -> Self {
        if summary.failed > 0 {
            OverallHealth::Unhealthy
        } else if summary.warnings > 0 {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub timestamp: DateTime<Utc>,
    pub overall: OverallHealth,
    pub checks: Vec<DiagnosticCheck>,
    pub summary: DiagnosticSummary,
}

impl DiagnosticsReport {
    pub fn from_checks(checks: Vec<DiagnosticCheck>) -> Self {
        let summary = DiagnosticSummary::from_checks(&checks);
        Self {
            timestamp: Utc::now(),
            overall: OverallHealth::from_summary(&summary),
            checks,
            summary,
        }
    }
}

/// Every check the runner knows, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckId {
    PythonVersion,
    Pip,
    VirtualEnv,
    WorkerPackage,
    LitellmPackage,
    LangfusePackage,
    ControlPlane,
    ApiKey,
    WorkerProcess,
    WorkerDirectory,
}

impl CheckId {
    pub const ALL: [CheckId; 10] = [
        CheckId::PythonVersion,
        CheckId::Pip,
        CheckId::VirtualEnv,
        CheckId::WorkerPackage,
        CheckId::LitellmPackage,
        CheckId::LangfusePackage,
        CheckId::ControlPlane,
        CheckId::ApiKey,
        CheckId::WorkerProcess,
        CheckId::WorkerDirectory,
    ];

    pub fn name(self) -> String {
        match self {
            CheckId::PythonVersion => "Python Version".into(),
            CheckId::Pip => "pip Available".into(),
            CheckId::VirtualEnv => "Virtual Environment".into(),
            CheckId::WorkerPackage => format!("Package: {}", checks::WORKER_PACKAGE),
            CheckId::LitellmPackage => "Package: litellm".into(),
            CheckId::LangfusePackage => "Package: langfuse".into(),
            CheckId::ControlPlane => "Control Plane Connection".into(),
            CheckId::ApiKey => "API Key Configuration".into(),
            CheckId::WorkerProcess => "Worker Process".into(),
            CheckId::WorkerDirectory => "Worker Directory".into(),
        }
    }

    pub fn category(self) -> DiagnosticCategory {
        match self {
            CheckId::PythonVersion | CheckId::Pip | CheckId::VirtualEnv => DiagnosticCategory::Python,
            CheckId::WorkerPackage | CheckId::LitellmPackage | CheckId::LangfusePackage => {
                DiagnosticCategory::Packages
            }
            CheckId::ControlPlane => DiagnosticCategory::Connectivity,
            CheckId::ApiKey | CheckId::WorkerDirectory => DiagnosticCategory::Config,
            CheckId::WorkerProcess => DiagnosticCategory::Process,
        }
    }

    /// Checks run for a category request.
    pub fn for_category(category: DiagnosticCategory) -> &'static [CheckId] {
        match category {
            DiagnosticCategory::Python => &[CheckId::PythonVersion, CheckId::Pip, CheckId::VirtualEnv],
            DiagnosticCategory::Packages => &[
                CheckId::WorkerPackage,
                CheckId::LitellmPackage,
                CheckId::LangfusePackage,
            ],
            DiagnosticCategory::Connectivity => &[CheckId::ControlPlane, CheckId::ApiKey],
            DiagnosticCategory::Process => &[CheckId::WorkerProcess, CheckId::WorkerDirectory],
            DiagnosticCategory::Config => &[CheckId::ApiKey, CheckId::WorkerDirectory],
        }
    }
}

/// What a check decided, before the runner stamps name, category, and timing.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub status: DiagnosticStatus,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub remediation: Option<String>,
}

impl Verdict {
    pub fn new(status: DiagnosticStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
            remediation: None,
        }
    }

    pub fn pass(message: impl Into<String>) -> Self {
        Self::new(DiagnosticStatus::Pass, message)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(DiagnosticStatus::Fail, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(DiagnosticStatus::Warning, message)
    }

    pub fn skip(message: impl Into<String>) -> Self {
        Self::new(DiagnosticStatus::Skip, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}

/// Runs diagnostics against the worker's environment.
pub struct DiagnosticsRunner {
    pub(crate) worker_dir: PathBuf,
    pub(crate) control_plane_url: String,
    pub(crate) api_key: SecretString,
    pub(crate) worker_pid: u32,
    pub(crate) http: reqwest::Client,
    check_timeout: Duration,
}

impl DiagnosticsRunner {
    pub fn new(config: &ConsoleConfig) -> Self {
        Self {
            worker_dir: config.worker_dir.clone(),
            control_plane_url: config.control_plane_url.clone(),
            api_key: config.api_key.clone(),
            worker_pid: config.worker_pid,
            http: reqwest::Client::new(),
            check_timeout: CHECK_TIMEOUT,
        }
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Run one check under the per-check timeout.
    pub async fn run_check(&self, id: CheckId) -> DiagnosticCheck {
        let started = Instant::now();
        let verdict = match tokio::time::timeout(self.check_timeout, self.evaluate(id)).await {
            Ok(verdict) => verdict,
            Err(_) => Verdict::fail(format!(
                "Check timed out after {}s",
                self.check_timeout.as_secs()
            )),
        };
        let check = DiagnosticCheck {
            name: id.name(),
            category: id.category(),
            status: verdict.status,
            message: verdict.message,
            details: verdict.details,
            duration_ms: started.elapsed().as_millis() as u64,
            remediation: verdict.remediation,
        };
        debug!(check = %check.name, status = ?check.status, duration_ms = check.duration_ms, "Diagnostic check finished");
        check
    }

    async fn evaluate(&self, id: CheckId) -> Verdict {
        match id {
            CheckId::PythonVersion => self.check_python_version().await,
            CheckId::Pip => self.check_pip().await,
            CheckId::VirtualEnv => self.check_virtualenv().await,
            CheckId::WorkerPackage => self.check_package(checks::WORKER_PACKAGE, "worker", true).await,
            CheckId::LitellmPackage => self.check_package("litellm", "LiteLLM proxy", false).await,
            CheckId::LangfusePackage => self.check_package("langfuse", "observability", false).await,
            CheckId::ControlPlane => self.check_control_plane().await,
            CheckId::ApiKey => self.check_api_key(),
            CheckId::WorkerProcess => self.check_worker_process().await,
            CheckId::WorkerDirectory => self.check_worker_directory().await,
        }
    }

    async fn run_checks(&self, ids: &[CheckId]) -> DiagnosticsReport {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.run_check(*id).await);
        }
        let report = DiagnosticsReport::from_checks(results);
        info!(overall = ?report.overall, failed = report.summary.failed, warnings = report.summary.warnings, "Diagnostics complete");
        report
    }

    /// Run every check in order.
    pub async fn run_all(&self) -> DiagnosticsReport {
        self.run_checks(&CheckId::ALL).await
    }

    pub async fn run_category(&self, category: DiagnosticCategory) -> DiagnosticsReport {
        self.run_checks(CheckId::for_category(category)).await
    }

    /// Run every check, sending each result as it completes. Stops early when
    /// the receiver is gone or `cancel` fires; the report covers what ran.
    pub async fn run_streaming(
        &self,
        tx: mpsc::Sender<DiagnosticCheck>,
        cancel: CancellationToken,
    ) -> DiagnosticsReport {
        let mut results = Vec::with_capacity(CheckId::ALL.len());
        for id in CheckId::ALL {
            let check = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                check = self.run_check(id) => check,
            };
            results.push(check.clone());
            if tx.send(check).await.is_err() {
                debug!("Diagnostics receiver gone, stopping early");
                break;
            }
        }
        DiagnosticsReport::from_checks(results)
    }
}
