//! Error types for promhook
//!
//! `AppError` covers configuration, registration and export failures and
//! implements `IntoResponse` for Axum handlers. Backend-facing wrappers carry
//! their own error types (`CacheError`, `MigrationError`) so that instrumented
//! operations return exactly what the wrapped backend would.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file {path}: {source}")]
    ConfigFileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ConfigParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration in {path}: {reason}")]
    ConfigValidationFailed { path: String, reason: String },

    #[error("Metric registration failed: {0}")]
    Registration(#[from] prometheus::Error),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Push(#[from] PushError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Config(_)
            | Self::ConfigFileRead { .. }
            | Self::ConfigParseFailed { .. }
            | Self::ConfigValidationFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Push(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(error = %self, status = status.as_u16(), "Request failed");

        (status, self.to_string()).into_response()
    }
}

/// Convenience type alias for Results
pub type AppResult<T> = Result<T, AppError>;

/// Standalone exporter startup failures
#[derive(Error, Debug)]
pub enum ExportError {
    #[error(
        "The standalone exporter can't be used while an auto-reloader is active (RUN_MAIN=true). \
        Mount the metrics handler in the application router, or disable the reloader."
    )]
    AutoReloader,

    #[error("Invalid export address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to bind exporter on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Push gateway delivery failures
#[derive(Error, Debug)]
pub enum PushError {
    #[error("Invalid push gateway URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to encode metrics for job '{job}': {reason}")]
    Encode { job: String, reason: String },

    #[error("Push to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Push gateway {url} rejected job '{job}' with status {status}")]
    Rejected {
        url: String,
        job: String,
        status: u16,
    },
}

/// Errors reported by cache backends
///
/// Transient errors (a dropped connection, a timed out round-trip) are the
/// ones an instrumented cache may be configured to swallow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache connection interrupted: {0}")]
    ConnectionInterrupted(String),

    #[error("Cache operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Cache backend error: {0}")]
    Backend(String),
}

impl CacheError {
    /// Whether the failure is transient and may be ignored by configuration
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionInterrupted(_) | Self::Timeout(_))
    }
}

/// Errors reported while computing migration state for a connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("Database '{alias}' is unavailable: {reason}")]
    Unavailable { alias: String, reason: String },

    #[error("Migration history for '{alias}' is inconsistent: {reason}")]
    Inconsistent { alias: String, reason: String },
}
