//! Error type shared by every usbgate crate.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type GateResult<T> = Result<T, GateError>;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse TOML configuration: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("failed to process YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to process JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("registry store {path} is unreadable: {reason}")]
    Store { path: PathBuf, reason: String },

    #[error("remote sync failed: {0}")]
    Remote(String),

    #[error("device query failed: {0}")]
    DeviceQuery(String),

    #[error("shutdown command failed: {0}")]
    Shutdown(String),
}

impl From<reqwest::Error> for GateError {
    fn from(err: reqwest::Error) -> Self {
        GateError::Remote(err.to_string())
    }
}
