//! Individual diagnostic checks.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde_json::json;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::process::Command;

use super::{DiagnosticsRunner, Verdict};

/// Package the worker itself is distributed as.
pub const WORKER_PACKAGE: &str = "kubiya-control-plane-api";

/// Minimum supported Python version.
const MIN_PYTHON: (u32, u32) = (3, 8);

/// Timeout for the control-plane health request.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

static PYTHON_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Python\s+(\d+)\.(\d+)").expect("valid regex"));

const PYTHON_INSTALL_HINT: &str = "Install Python 3.11: use your package manager \
    (apt install python3.11 python3.11-venv, dnf install python3.11, brew install python@3.11) \
    or download from https://www.python.org/downloads/";

fn venv_dir(worker_dir: &Path) -> PathBuf {
    worker_dir.join("venv")
}

fn venv_bin(worker_dir: &Path, name: &str) -> PathBuf {
    venv_dir(worker_dir).join("bin").join(name)
}

/// First of `python3`/`python` that answers `--version`, with its version line.
async fn find_python() -> Option<(&'static str, String)> {
    for cmd in ["python3", "python"] {
        let Ok(output) = Command::new(cmd).arg("--version").output().await else {
            continue;
        };
        if output.status.success() {
            // Older interpreters print the version on stderr.
            let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if text.is_empty() {
                text = String::from_utf8_lossy(&output.stderr).trim().to_string();
            }
            return Some((cmd, text));
        }
    }
    None
}

/// `(major, minor)` from a `Python X.Y.Z` line.
pub fn parse_python_version(version: &str) -> Option<(u32, u32)> {
    let caps = PYTHON_VERSION.captures(version)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Value of the `Version:` line in `pip show` output.
pub fn parse_pip_show_version(output: &str) -> String {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Version:"))
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Short preview of an API key: first 10 and last 6 characters.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 20 {
        return "***".to_string();
    }
    let head: String = chars[..10].iter().collect();
    let tail: String = chars[chars.len() - 6..].iter().collect();
    format!("{head}...{tail}")
}

/// Binary byte count, e.g. `1.5 KB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {suffix}B", bytes as f64 / div as f64)
}

/// Whether `pid` names a live process.
pub fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process_specifics(Pid::from_u32(pid), ProcessRefreshKind::new())
}

/// Regular files below `dir`: count and total size.
async fn directory_usage(dir: &Path) -> (u64, u64) {
    let mut count = 0;
    let mut size = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                count += 1;
                size += meta.len();
            }
        }
    }
    (count, size)
}

impl DiagnosticsRunner {
    pub(super) async fn check_python_version(&self) -> Verdict {
        let Some((cmd, version)) = find_python().await else {
            return Verdict::fail(format!("Python {}.{}+ not found", MIN_PYTHON.0, MIN_PYTHON.1))
                .with_remediation(PYTHON_INSTALL_HINT);
        };
        let Some((major, minor)) = parse_python_version(&version) else {
            return Verdict::warning(format!("Could not parse Python version: {version}"));
        };
        if (major, minor) < MIN_PYTHON {
            return Verdict::fail(format!(
                "Python {major}.{minor} found, but {}.{}+ required",
                MIN_PYTHON.0, MIN_PYTHON.1
            ))
            .with_remediation(PYTHON_INSTALL_HINT);
        }
        Verdict::pass(format!("Python {major}.{minor} found ({cmd})"))
            .with_details(json!({"version": version, "path": cmd}))
    }

    pub(super) async fn check_pip(&self) -> Verdict {
        let Some((cmd, _)) = find_python().await else {
            return Verdict::skip("Skipped: Python not found");
        };
        match Command::new(cmd).args(["-m", "pip", "--version"]).output().await {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                let version = text.split_whitespace().nth(1).unwrap_or("unknown").to_string();
                Verdict::pass(format!("pip {version} available"))
                    .with_details(json!({"pip_version": version}))
            }
            _ => Verdict::fail("pip is not available")
                .with_remediation(format!("Run: {cmd} -m ensurepip --upgrade")),
        }
    }

    pub(super) async fn check_virtualenv(&self) -> Verdict {
        let venv = venv_dir(&self.worker_dir);
        if !tokio::fs::try_exists(&venv).await.unwrap_or(false) {
            return Verdict::warning("Virtual environment not found")
                .with_remediation("Worker will create venv on first run");
        }
        if !tokio::fs::try_exists(venv_bin(&self.worker_dir, "python"))
            .await
            .unwrap_or(false)
        {
            return Verdict::fail("Virtual environment exists but appears corrupted")
                .with_remediation(format!("Remove and recreate: rm -rf {}", venv.display()));
        }
        Verdict::pass("Virtual environment ready")
            .with_details(json!({"venv_path": venv.display().to_string(), "venv_active": true}))
    }

    pub(super) async fn check_package(&self, package: &str, purpose: &str, required: bool) -> Verdict {
        let pip = venv_bin(&self.worker_dir, "pip");
        if !tokio::fs::try_exists(&pip).await.unwrap_or(false) {
            return if required {
                Verdict::fail("Virtual environment not set up")
                    .with_remediation("Run worker to initialize environment")
            } else {
                Verdict::skip("Virtual environment not set up")
            };
        }

        match Command::new(&pip).args(["show", package]).output().await {
            Ok(output) if output.status.success() => {
                let version = parse_pip_show_version(&String::from_utf8_lossy(&output.stdout));
                Verdict::pass(format!("{package} v{version} installed")).with_details(json!({
                    "name": package,
                    "installed_version": version,
                    "is_installed": true,
                }))
            }
            _ if required => Verdict::fail(format!("{package} not installed (required for {purpose})"))
                .with_remediation(format!("Run: {} install {package}", pip.display())),
            _ => Verdict::warning(format!("{package} not installed (optional for {purpose})"))
                .with_remediation(format!("Install with: {} install {package}", pip.display())),
        }
    }

    pub(super) async fn check_control_plane(&self) -> Verdict {
        if self.control_plane_url.is_empty() {
            return Verdict::skip("Control plane URL not configured");
        }

        let url = format!("{}/api/health", self.control_plane_url.trim_end_matches('/'));
        let mut request = self.http.get(&url).timeout(CONNECTIVITY_TIMEOUT);
        let key = self.api_key.expose_secret();
        if !key.is_empty() {
            request = request.header("Authorization", format!("UserKey {key}"));
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Verdict::fail(format!("Connection failed: {e}"))
                    .with_remediation("Check network connectivity and firewall settings");
            }
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        let status = response.status();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Verdict::warning("Connected but authentication failed")
                    .with_remediation("Check your API key: kubiya login")
                    .with_details(json!({"status_code": status.as_u16(), "latency_ms": latency_ms}))
            }
            StatusCode::OK => Verdict::pass(format!("Connected to control plane ({latency_ms}ms)"))
                .with_details(json!({"url": self.control_plane_url, "latency_ms": latency_ms})),
            other => Verdict::warning(format!("Control plane returned status {}", other.as_u16()))
                .with_details(json!({"status_code": other.as_u16(), "latency_ms": latency_ms})),
        }
    }

    pub(super) fn check_api_key(&self) -> Verdict {
        let key = self.api_key.expose_secret();
        if key.is_empty() {
            return Verdict::fail("API key not configured").with_remediation("Run: kubiya login");
        }
        if key.split('.').count() != 3 {
            return Verdict::warning("API key format appears invalid")
                .with_remediation("Regenerate API key: kubiya login");
        }
        Verdict::pass("API key configured").with_details(json!({"key_preview": mask_api_key(key)}))
    }

    pub(super) async fn check_worker_process(&self) -> Verdict {
        let pid = self.worker_pid;
        if pid == 0 {
            return Verdict::warning("Worker PID not available");
        }
        if process_alive(pid) {
            Verdict::pass(format!("Worker process running (PID: {pid})")).with_details(json!({"pid": pid}))
        } else {
            Verdict::fail(format!("Worker process not running (PID: {pid})"))
        }
    }

    pub(super) async fn check_worker_directory(&self) -> Verdict {
        let dir = &self.worker_dir;
        if dir.as_os_str().is_empty() {
            return Verdict::fail("Worker directory not configured");
        }

        let meta = match tokio::fs::metadata(dir).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Verdict::warning("Worker directory does not exist (will be created on start)")
                    .with_details(json!({"path": dir.display().to_string()}));
            }
            Err(e) => return Verdict::fail(format!("Cannot access worker directory: {e}")),
        };
        if !meta.is_dir() {
            return Verdict::fail("Worker path exists but is not a directory");
        }

        let probe = dir.join(".write_test");
        if tokio::fs::write(&probe, b"test").await.is_err() {
            return Verdict::warning("Worker directory exists but may not be writable");
        }
        let _ = tokio::fs::remove_file(&probe).await;

        let (file_count, size) = directory_usage(dir).await;
        Verdict::pass(format!(
            "Worker directory ready ({file_count} files, {})",
            format_bytes(size)
        ))
        .with_details(json!({
            "path": dir.display().to_string(),
            "exists": true,
            "writable": true,
            "size": size,
            "file_count": file_count,
        }))
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::config::ConsoleConfig;
    use crate::diagnostics::DiagnosticStatus;

    fn runner_with_key(key: &str, dir: &Path) -> DiagnosticsRunner {
        let config = ConsoleConfig {
            api_key: SecretString::from(key.to_string()),
            worker_dir: dir.to_path_buf(),
            ..Default::default()
        };
        DiagnosticsRunner::new(&config)
    }

    #[test]
    fn python_version_parsing() {
        assert_eq!(parse_python_version("Python 3.11.4"), Some((3, 11)));
        assert_eq!(parse_python_version("Python 2.7"), Some((2, 7)));
        assert_eq!(parse_python_version("garbage"), None);
        assert!((3, 7) < MIN_PYTHON);
        assert!((3, 10) >= MIN_PYTHON);
    }

    #[test]
    fn pip_show_version() {
        assert_eq!(parse_pip_show_version("Name: litellm\nVersion: 1.40.0\n"), "1.40.0");
        assert_eq!(parse_pip_show_version("Name: x\n"), "unknown");
    }

    #[test]
    fn api_key_masking() {
        assert_eq!(mask_api_key("short"), "***");
        assert_eq!(mask_api_key("abcdefghij0123456789xyz"), "abcdefghij...789xyz");
    }

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn api_key_shapes() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(runner_with_key("", dir.path()).check_api_key().status, DiagnosticStatus::Fail);
        assert_eq!(
            runner_with_key("not-a-jwt", dir.path()).check_api_key().status,
            DiagnosticStatus::Warning
        );
        let verdict = runner_with_key("aaaaaaaaaa.bbbbbbbbbb.cccccc", dir.path()).check_api_key();
        assert_eq!(verdict.status, DiagnosticStatus::Pass);
        assert_eq!(verdict.details.unwrap()["key_preview"], "aaaaaaaaaa...cccccc");
    }

    #[tokio::test]
    async fn worker_directory_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("a.txt"), vec![0u8; 1024]).await.unwrap();
        tokio::fs::write(dir.path().join("sub/b.txt"), b"hi").await.unwrap();

        let verdict = runner_with_key("", dir.path()).check_worker_directory().await;
        assert_eq!(verdict.status, DiagnosticStatus::Pass);
        let details = verdict.details.unwrap();
        assert_eq!(details["file_count"], 2);
        assert_eq!(details["size"], 1026);
        assert!(!dir.path().join(".write_test").exists());
    }

    #[tokio::test]
    async fn missing_worker_directory_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with_key("", &dir.path().join("nope"));
        assert_eq!(runner.check_worker_directory().await.status, DiagnosticStatus::Warning);
    }

    #[tokio::test]
    async fn packages_without_venv() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with_key("", dir.path());
        assert_eq!(
            runner.check_package(WORKER_PACKAGE, "worker", true).await.status,
            DiagnosticStatus::Fail
        );
        assert_eq!(
            runner.check_package("langfuse", "observability", false).await.status,
            DiagnosticStatus::Skip
        );
        assert_eq!(runner.check_virtualenv().await.status, DiagnosticStatus::Warning);
    }

    #[tokio::test]
    async fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(u32::MAX - 1));
        let dir = tempfile::tempdir().unwrap();
        let verdict = runner_with_key("", dir.path()).check_worker_process().await;
        assert_eq!(verdict.status, DiagnosticStatus::Pass);
    }

    #[tokio::test]
    async fn unconfigured_control_plane_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = runner_with_key("", dir.path()).check_control_plane().await;
        assert_eq!(verdict.status, DiagnosticStatus::Skip);
    }
}
