//! Remote service boundary
//!
//! Everything above this crate only needs to know *how* a remote call failed,
//! not what the payloads look like. `ErrorClassification` is that contract:
//! - Transient retries via backoff or the next scheduler tick
//! - Authentication triggers a credential refresh / login fallback
//! - Unavailable is retried like Transient but reported upward unchanged
//! - Permanent stops retrying and surfaces to the caller
//!
//! `PagedSequence` turns a "page N of size S" endpoint into a lazy stream.

pub mod classify;
pub mod paged;

pub use classify::{classify_status, classify_transport, error_for_response};
pub use paged::{Page, PagedSequence};

use serde::Serialize;
use std::fmt;

/// Classification of remote failures to determine retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    /// Timeouts, connection resets, 5xx - retry later
    Transient,
    /// Bad request / invalid or revoked token - re-authenticate
    Authentication,
    /// Service reports maintenance or is deliberately unavailable
    Unavailable,
    /// Anything retrying will not fix
    Permanent,
}

impl ErrorClassification {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::Authentication => "authentication",
            ErrorClassification::Unavailable => "unavailable",
            ErrorClassification::Permanent => "permanent",
        }
    }

    /// Whether waiting and trying again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClassification::Transient | ErrorClassification::Unavailable
        )
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors that know how they should be handled by the retry machinery.
pub trait Classified {
    fn classification(&self) -> ErrorClassification;
}

/// A failed remote call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{classification} remote failure: {message}")]
pub struct RemoteError {
    pub classification: ErrorClassification,
    pub message: String,
}

impl RemoteError {
    pub fn new(classification: ErrorClassification, message: impl Into<String>) -> Self {
        Self {
            classification,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::Transient, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::Authentication, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::Unavailable, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::Permanent, message)
    }
}

impl Classified for RemoteError {
    fn classification(&self) -> ErrorClassification {
        self.classification
    }
}

/// Result alias for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;
