//! Error types for the edge router and the deploy pipeline.

use reqwest::StatusCode;
use thiserror::Error;

/// A required configuration value is missing or malformed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failures of the deploy pipeline (manifest, upload session, finalize).
///
/// Platform rejections carry the platform's own error text, since the deploy
/// path is operator facing.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid deploy request: {0}")]
    InvalidRequest(String),

    #[error("Failed to read asset {path}: {source}")]
    AssetRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to walk assets directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context} transport error: {source}")]
    Transport {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{context} failed ({status}): {message}")]
    Platform {
        context: String,
        status: StatusCode,
        message: String,
    },

    #[error("{context} returned an unexpected response: {message}")]
    UnexpectedResponse { context: String, message: String },

    #[error("Platform requested unknown asset hash {0}")]
    UnknownAssetHash(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeployError {
    pub(crate) fn transport(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    /// Whether the caller must fix configuration before retrying.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::InvalidRequest(_))
    }
}

/// Failures resolving a sandbox preview upstream.
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("Invalid preview host: {0}")]
    InvalidHost(String),

    #[error("Sandbox control plane request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Sandbox control plane returned {status} for {action}")]
    Status { action: String, status: StatusCode },

    #[error("Sandbox {0} not found")]
    SandboxNotFound(String),
}

/// Failures forwarding a request to a published worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Worker {0} not found")]
    NotFound(String),

    #[error("Invalid dispatch target: {0}")]
    InvalidTarget(String),

    #[error("Dispatch transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

pub type DeployResult<T> = Result<T, DeployError>;
