//! Worker environment editor with masked listing, an in-process overlay and `.env` persistence.
//!
//! Edits never touch the console's own process environment. They live in an
//! overlay that is applied to every subprocess the console spawns and can be
//! written to the worker's `.env` file.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::EnvFileError;

/// Substrings marking a key as secret.
const SENSITIVE_PATTERNS: &[&str] = &[
    "KEY", "SECRET", "TOKEN", "PASSWORD", "CREDENTIAL", "API_KEY", "APIKEY", "AUTH", "PRIVATE",
];

/// OS-level variables shown read-only.
const SYSTEM_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "TERM", "LANG", "LC_ALL", "PWD", "TMPDIR", "TEMP", "TMP",
];

/// Prefixes of variables the worker itself consumes.
const WORKER_PREFIXES: &[&str] = &[
    "KUBIYA_", "LITELLM_", "LANGFUSE_", "OPENAI_", "ANTHROPIC_", "AZURE_", "AWS_", "GOOGLE_", "VERTEX_",
];

const HEADER_TITLE: &str = "# Worker Environment Variables";
const HEADER_GENERATOR: &str = "# Generated by worker console";
const HEADER_UPDATED: &str = "# Last updated:";

/// Where a variable's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvSource {
    /// Set in the worker `.env` file or through the console.
    Custom,
    /// OS-level variable.
    System,
    /// Variable the worker reads (by prefix).
    Worker,
    /// Anything else inherited from the parent process.
    Inherited,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvVariable {
    pub key: String,
    pub value: String,
    pub source: EnvSource,
    pub sensitive: bool,
    pub editable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvUpdateRequest {
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub save_to_file: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvUpdateResponse {
    pub success: bool,
    pub message: String,
    pub restart_needed: bool,
    pub updated_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_file_path: Option<String>,
}

pub fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SENSITIVE_PATTERNS.iter().any(|p| upper.contains(p))
}

/// Mask a secret: short values fully, longer ones keeping four chars each side.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "********".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

fn is_system_var(key: &str) -> bool {
    SYSTEM_VARS.contains(&key)
}

fn is_worker_var(key: &str) -> bool {
    WORKER_PREFIXES.iter().any(|p| key.starts_with(p))
}

pub fn classify_source(key: &str, custom: &BTreeSet<String>) -> EnvSource {
    if custom.contains(key) {
        EnvSource::Custom
    } else if is_system_var(key) {
        EnvSource::System
    } else if is_worker_var(key) {
        EnvSource::Worker
    } else {
        EnvSource::Inherited
    }
}

/// Parsed `.env` content: variables plus user comments worth keeping.
#[derive(Debug, Default, PartialEq)]
pub struct EnvFile {
    pub vars: BTreeMap<String, String>,
    pub comments: Vec<String>,
}

fn is_header_comment(line: &str) -> bool {
    line.starts_with(HEADER_TITLE) || line.starts_with(HEADER_GENERATOR) || line.starts_with(HEADER_UPDATED)
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    let quoted = raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"')) || (raw.starts_with('\'') && raw.ends_with('\'')));
    if !quoted {
        return raw.to_string();
    }
    let inner = &raw[1..raw.len() - 1];
    if raw.starts_with('\'') {
        return inner.to_string();
    }

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn quote_if_needed(value: &str) -> String {
    if !value.contains([' ', '\t', '\n', '"', '\'', '$', '\\']) {
        return value.to_string();
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");
    format!("\"{escaped}\"")
}

impl EnvFile {
    pub fn parse(content: &str) -> Self {
        let mut file = EnvFile::default();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('#') {
                if !is_header_comment(trimmed) {
                    file.comments.push(trimmed.to_string());
                }
                continue;
            }
            let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
            if let Some((key, value)) = trimmed.split_once('=') {
                let key = key.trim();
                if !key.is_empty() {
                    file.vars.insert(key.to_string(), unquote(value));
                }
            }
        }
        file
    }

    /// Render with a fresh header, preserved comments, then sorted keys.
    pub fn render(&self) -> String {
        let mut out = format!(
            "{HEADER_TITLE}\n{HEADER_GENERATOR}\n{HEADER_UPDATED} {}\n\n",
            Utc::now().to_rfc3339()
        );
        if !self.comments.is_empty() {
            for comment in &self.comments {
                out.push_str(comment);
                out.push('\n');
            }
            out.push('\n');
        }
        for (key, value) in &self.vars {
            out.push_str(&format!("{key}={}\n", quote_if_needed(value)));
        }
        out
    }

    pub async fn load(path: &Path) -> Result<Self, EnvFileError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EnvFileError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Holds the environment overlay and the worker's `.env` location.
pub struct EnvManager {
    env_file: PathBuf,
    overlay: RwLock<BTreeMap<String, String>>,
}

impl EnvManager {
    pub fn new(worker_dir: &Path) -> Self {
        Self::with_file(worker_dir.join(".env"))
    }

    pub fn with_file(env_file: PathBuf) -> Self {
        Self {
            env_file,
            overlay: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    /// Snapshot of the overlay, applied to spawned subprocesses.
    pub async fn overlay(&self) -> BTreeMap<String, String> {
        self.overlay.read().await.clone()
    }

    async fn file_vars(&self) -> Result<EnvFile, EnvFileError> {
        match EnvFile::load(&self.env_file).await {
            Err(EnvFileError::NotFound(_)) => Ok(EnvFile::default()),
            other => other,
        }
    }

    /// Effective variables (process, then `.env`, then overlay), sorted by
    /// key, with secrets masked.
    pub async fn list(&self) -> Result<Vec<EnvVariable>, EnvFileError> {
        let file = self.file_vars().await?;
        let overlay = self.overlay().await;

        let mut effective: BTreeMap<String, String> = std::env::vars().collect();
        let mut custom: BTreeSet<String> = BTreeSet::new();
        for (key, value) in file.vars.iter().chain(overlay.iter()) {
            effective.insert(key.clone(), value.clone());
            custom.insert(key.clone());
        }

        Ok(effective
            .into_iter()
            .map(|(key, value)| {
                let source = classify_source(&key, &custom);
                let sensitive = is_sensitive_key(&key);
                EnvVariable {
                    value: if sensitive { mask_value(&value) } else { value },
                    editable: source != EnvSource::System,
                    source,
                    sensitive,
                    key,
                }
            })
            .collect())
    }

    fn current_value(&self, key: &str, overlay: &BTreeMap<String, String>) -> Option<String> {
        overlay.get(key).cloned().or_else(|| std::env::var(key).ok())
    }

    /// Apply edits to the overlay, optionally persisting them.
    ///
    /// System variables are skipped. A sensitive value equal to its own mask
    /// is treated as unchanged.
    pub async fn update(&self, request: EnvUpdateRequest) -> Result<EnvUpdateResponse, EnvFileError> {
        let mut updated_keys = Vec::new();
        {
            let mut overlay = self.overlay.write().await;
            for (key, value) in request.variables {
                let key = key.trim().to_string();
                if key.is_empty() || is_system_var(&key) {
                    continue;
                }
                if is_sensitive_key(&key) {
                    if let Some(current) = self.current_value(&key, &overlay) {
                        if mask_value(&current) == value {
                            continue;
                        }
                    }
                }
                overlay.insert(key.clone(), value);
                updated_keys.push(key);
            }
        }

        info!(count = updated_keys.len(), "Environment overlay updated");

        let mut message = format!("Updated {} variable(s)", updated_keys.len());
        let mut env_file_path = None;
        if request.save_to_file {
            let (path, count) = self.save().await?;
            message = format!("{message}; saved {count} variable(s) to {path}");
            env_file_path = Some(path);
        }

        Ok(EnvUpdateResponse {
            success: true,
            message,
            restart_needed: !updated_keys.is_empty(),
            updated_keys,
            env_file_path,
        })
    }

    /// Write custom and worker variables to the `.env` file, keeping user
    /// comments. Returns the path and the number of variables written.
    pub async fn save(&self) -> Result<(String, usize), EnvFileError> {
        let mut file = self.file_vars().await?;
        for (key, value) in std::env::vars().filter(|(k, _)| is_worker_var(k)) {
            file.vars.entry(key).or_insert(value);
        }
        for (key, value) in self.overlay().await {
            file.vars.insert(key, value);
        }

        if let Some(parent) = self.env_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.env_file, file.render()).await?;

        let path = self.env_file.display().to_string();
        info!(path = %path, count = file.vars.len(), "Environment saved");
        Ok((path, file.vars.len()))
    }

    /// Load the `.env` file into the overlay. Returns the keys loaded.
    pub async fn reload(&self) -> Result<Vec<String>, EnvFileError> {
        let file = EnvFile::load(&self.env_file).await?;
        let keys: Vec<String> = file.vars.keys().cloned().collect();
        self.overlay.write().await.extend(file.vars);
        info!(count = keys.len(), "Environment reloaded from file");
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_keys_and_masking() {
        assert!(is_sensitive_key("OPENAI_API_KEY"));
        assert!(is_sensitive_key("db_password"));
        assert!(!is_sensitive_key("LOG_LEVEL"));

        assert_eq!(mask_value("short"), "********");
        assert_eq!(mask_value("12345678"), "********");
        assert_eq!(mask_value("sk-abcdefghijkl"), "sk-a...ijkl");
    }

    #[test]
    fn source_precedence() {
        let custom: BTreeSet<String> = ["PATH".to_string(), "MY_VAR".to_string()].into();
        assert_eq!(classify_source("PATH", &custom), EnvSource::Custom);
        assert_eq!(classify_source("HOME", &custom), EnvSource::System);
        assert_eq!(classify_source("LITELLM_MASTER_KEY", &custom), EnvSource::Worker);
        assert_eq!(classify_source("RANDOM", &custom), EnvSource::Inherited);
    }

    #[test]
    fn parse_handles_quotes_comments_and_export() {
        let file = EnvFile::parse(
            "# Worker Environment Variables\n# my note\n\nexport A=1\nB=\"two words\"\nC='it''s'\nD=\"say \\\"hi\\\"\"\n",
        );
        assert_eq!(file.comments, vec!["# my note"]);
        assert_eq!(file.vars["A"], "1");
        assert_eq!(file.vars["B"], "two words");
        assert_eq!(file.vars["D"], "say \"hi\"");
    }

    #[test]
    fn render_sorts_quotes_and_reparses() {
        let mut file = EnvFile::default();
        file.comments.push("# keep me".into());
        file.vars.insert("Z".into(), "plain".into());
        file.vars.insert("A".into(), "has $dollar and \"quote\"".into());
        file.vars.insert("M".into(), "line1\nline2".into());

        let rendered = file.render();
        assert!(rendered.starts_with(HEADER_TITLE));
        let a = rendered.find("\nA=").unwrap();
        let z = rendered.find("\nZ=").unwrap();
        assert!(a < z);
        assert!(rendered.contains("Z=plain\n"));

        assert_eq!(EnvFile::parse(&rendered), file);
    }

    #[tokio::test]
    async fn update_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let manager = EnvManager::new(dir.path());

        let response = manager
            .update(EnvUpdateRequest {
                variables: [
                    ("CONSOLE_TEST_FLAG".to_string(), "on".to_string()),
                    ("PATH".to_string(), "/nope".to_string()),
                ]
                .into(),
                save_to_file: true,
            })
            .await
            .unwrap();
        assert!(response.success);
        assert!(response.restart_needed);
        assert_eq!(response.updated_keys, vec!["CONSOLE_TEST_FLAG"]);
        assert!(response.env_file_path.is_some());

        let saved = tokio::fs::read_to_string(dir.path().join(".env")).await.unwrap();
        assert!(saved.contains("CONSOLE_TEST_FLAG=on"));
        assert!(!saved.contains("/nope"));

        let fresh = EnvManager::new(dir.path());
        // Inherited worker variables are saved too, so only membership is stable.
        let reloaded = fresh.reload().await.unwrap();
        assert!(reloaded.iter().any(|key| key == "CONSOLE_TEST_FLAG"));
        assert!(!reloaded.iter().any(|key| key == "PATH"));
        assert_eq!(fresh.overlay().await["CONSOLE_TEST_FLAG"], "on");
    }

    #[tokio::test]
    async fn masked_echo_does_not_overwrite_secret() {
        let dir = tempfile::tempdir().unwrap();
        let manager = EnvManager::new(dir.path());
        let set = |value: &str| EnvUpdateRequest {
            variables: [("CONSOLE_TEST_TOKEN".to_string(), value.to_string())].into(),
            save_to_file: false,
        };

        manager.update(set("tok-1234567890")).await.unwrap();
        let response = manager.update(set(&mask_value("tok-1234567890"))).await.unwrap();
        assert!(response.updated_keys.is_empty());
        assert_eq!(manager.overlay().await["CONSOLE_TEST_TOKEN"], "tok-1234567890");

        let listed = manager.list().await.unwrap();
        let token = listed.iter().find(|v| v.key == "CONSOLE_TEST_TOKEN").unwrap();
        assert_eq!(token.value, "tok-...7890");
        assert_eq!(token.source, EnvSource::Custom);
        assert!(token.sensitive);
    }

    #[tokio::test]
    async fn reload_without_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = EnvManager::new(dir.path());
        assert!(matches!(manager.reload().await, Err(EnvFileError::NotFound(_))));
    }
}
