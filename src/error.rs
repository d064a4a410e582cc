//! Error types for the worker console.

/// Top-level error type for the console.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Env file error: {0}")]
    EnvFile(#[from] EnvFileError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors talking to the remote control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("control plane client not configured")]
    NotConfigured,

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("stream returned status {status}: {body}")]
    Stream { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("request cancelled")]
    Cancelled,
}

/// Session lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} already has a subscriber")]
    AlreadySubscribed(String),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

/// Process sampling and log tailing errors.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("process {0} not found")]
    ProcessNotFound(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// `.env` file read/write errors.
#[derive(Debug, thiserror::Error)]
pub enum EnvFileError {
    #[error("No .env file found at {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the console.
pub type Result<T> = std::result::Result<T, Error>;
