//! Worker console: local control and observability plane for a worker process.

pub mod collector;
pub mod config;
pub mod control_plane;
pub mod diagnostics;
pub mod env;
pub mod error;
pub mod llm;
pub mod monitor;
pub mod normalizer;
pub mod proxy;
pub mod sessions;
pub mod state;
pub mod web;
