//! Daemon error and termination types

use remote::{Classified, ErrorClassification, RemoteError};
use thiserror::Error;

/// Failure of a tenant operation.
///
/// `Clone` because cached lookups hand the same failure to every waiting
/// reader.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Auth(#[from] auth::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl Classified for Error {
    fn classification(&self) -> ErrorClassification {
        match self {
            Error::Auth(e) => e.classification(),
            Error::Remote(e) => e.classification(),
        }
    }
}

/// Result alias using the daemon Error
pub type Result<T> = std::result::Result<T, Error>;

/// Why the process exits. The discriminant is the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitReason {
    Ok = 0,
    Config = 1,
    AuthenticationFailed = 2,
    RemoteUnavailable = 3,
    Failure = 4,
}

impl ExitReason {
    /// Exit reason for a failure that the daemon cannot recover from.
    pub fn for_classification(classification: ErrorClassification) -> Self {
        match classification {
            ErrorClassification::Authentication => ExitReason::AuthenticationFailed,
            ErrorClassification::Unavailable => ExitReason::RemoteUnavailable,
            ErrorClassification::Transient | ErrorClassification::Permanent => {
                ExitReason::Failure
            }
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn label(self) -> &'static str {
        match self {
            ExitReason::Ok => "ok",
            ExitReason::Config => "config",
            ExitReason::AuthenticationFailed => "authentication_failed",
            ExitReason::RemoteUnavailable => "remote_unavailable",
            ExitReason::Failure => "failure",
        }
    }
}

impl From<ExitReason> for std::process::ExitCode {
    fn from(reason: ExitReason) -> Self {
        std::process::ExitCode::from(reason as u8)
    }
}
