//! Error types for the conduit engine.
//!
//! Defines the error taxonomy surfaced to callers and the rules used to
//! reclassify raw backend failures into it.

use thiserror::Error;
use tracing::error;

/// Title used for every failed download.
pub const DOWNLOAD_FAILED_TITLE: &str = "The query result cannot be downloaded.";

/// Main error type for conduit operations.
#[derive(Error, Debug)]
pub enum ConduitError {
    /// Credentials are missing or were rejected by the backend.
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    /// The handle is unknown, closed, or the backend no longer recognises it.
    #[error("Query expired: {0}")]
    QueryExpired(String),

    /// Any other failure raised by the backend during execute/fetch/poll.
    #[error("Query error: {0}")]
    Query(String),

    /// Transport-level failures talking to a backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or incomplete configuration (detected before any network call).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bulk export failed; `detail` carries user-facing guidance.
    #[error("{title} {detail}")]
    Download { title: String, detail: String },

    /// Internal errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConduitError {
    /// Creates an authentication-required error with the given message.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthenticationRequired(msg.into())
    }

    /// Creates a query-expired error with the given message.
    pub fn expired(msg: impl Into<String>) -> Self {
        Self::QueryExpired(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Error for a handle that is not (or no longer) in the execution cache.
    pub fn unknown_handle(handle: impl std::fmt::Display) -> Self {
        Self::QueryExpired(format!("No live execution for handle {handle}"))
    }

    /// Classifies a raw backend message into the error taxonomy.
    pub fn from_backend_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        if msg.contains("Invalid query handle") || msg.contains("Invalid OperationHandle") {
            Self::QueryExpired(msg)
        } else if is_access_denied(&msg) {
            Self::AuthenticationRequired(msg)
        } else {
            Self::Query(msg)
        }
    }

    /// Reclassifies a generic query failure at the executor/fetcher boundary.
    ///
    /// Errors that already carry a specific kind pass through untouched.
    pub fn reclassify(self) -> Self {
        match self {
            Self::Query(msg) => {
                let classified = Self::from_backend_message(msg);
                if let Self::Query(ref detail) = classified {
                    error!("Query error: {}", detail);
                }
                classified
            }
            other => other,
        }
    }

    /// Wraps this error as a download failure with user-facing guidance.
    pub fn into_download(self) -> Self {
        let message = match self {
            download @ Self::Download { .. } => return download,
            Self::AuthenticationRequired(m)
            | Self::QueryExpired(m)
            | Self::Query(m)
            | Self::Connection(m)
            | Self::Config(m)
            | Self::Internal(m) => m,
        };
        Self::Download {
            title: DOWNLOAD_FAILED_TITLE.to_string(),
            detail: download_detail(&message),
        }
    }

    /// Returns true if the caller must re-execute the statement.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::QueryExpired(_))
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::AuthenticationRequired(_) => "Authentication Required",
            Self::QueryExpired(_) => "Query Expired",
            Self::Query(_) => "Query Error",
            Self::Connection(_) => "Connection Error",
            Self::Config(_) => "Configuration Error",
            Self::Download { .. } => "Download Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// MySQL error 1045 (SQLSTATE 28000), as reported by the different drivers.
fn is_access_denied(msg: &str) -> bool {
    msg.contains("(1045")
        || msg.contains("1045 (28000)")
        || msg.contains("Access denied for user")
}

/// Rewrites known backend failure messages into actionable guidance.
pub fn download_detail(message: &str) -> String {
    if message.contains("generic failure: Unable to find a callback: 32775") {
        format!("{message} Increase the sasl_max_buffer value in the server configuration.")
    } else if message.contains("query result cache exceeded its limit") {
        message.replace(
            "Restarting the fetch is not possible.",
            "Please execute the query again.",
        )
    } else {
        message.to_string()
    }
}

/// Result type alias using ConduitError.
pub type Result<T> = std::result::Result<T, ConduitError>;
