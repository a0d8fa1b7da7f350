//! Error types for grafana-lambda

use std::time::Duration;

use thiserror::Error;

/// Result type alias for grafana-lambda operations
pub type Result<T> = std::result::Result<T, GrafanaLambdaError>;

/// Main error type for grafana-lambda
#[derive(Error, Debug)]
pub enum GrafanaLambdaError {
    /// The store rejected the call for capacity reasons; always retried.
    #[error("Store throttled: {0}")]
    StoreThrottled(String),

    /// A conditional write lost to a live lock holder.
    #[error("Condition failed: {0}")]
    ConditionFailed(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Remote object missing: {key} (version {version:?})")]
    ObjectMissing {
        key: String,
        version: Option<String>,
    },

    #[error("Local server unreachable at {url} after {attempts} attempts: {source}")]
    Unreachable {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("Environment not provisioned: {0}")]
    Unprovisioned(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

impl GrafanaLambdaError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, GrafanaLambdaError::StoreThrottled(_))
    }
}
