//! Error types for harvest-ledger

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Failures raised by a [`LedgerStore`](crate::store::LedgerStore) implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Value out of range: {0}")]
    Overflow(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Lock poisoned: {0}")]
    Poisoned(String),
}

/// Errors surfaced to callers of the ledger and donation services.
///
/// Duplicate badge inserts never appear here: the store swallows them.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed input, rejected before any state change
    #[error("Validation error: {0}")]
    Validation(String),

    /// The store failed; nothing was committed and nothing was published
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller stopped waiting; the action itself still runs to completion
    #[error("Timed out after {0} ms waiting for the ledger")]
    Timeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            LedgerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Startup configuration problems.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;
