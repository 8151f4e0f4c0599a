//! Error types for authentication operations

use remote::{Classified, ErrorClassification, RemoteError};

/// Errors from authentication operations.
///
/// `Clone` so that callers queued behind one in-flight login or refresh can
/// all receive the same failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("authentication service unavailable: {0}")]
    Unavailable(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Classified for Error {
    fn classification(&self) -> ErrorClassification {
        match self {
            Error::Http(_) => ErrorClassification::Transient,
            Error::InvalidCredentials(_) => ErrorClassification::Authentication,
            Error::Unavailable(_) => ErrorClassification::Unavailable,
            Error::TokenExchange(_) | Error::CredentialParse(_) | Error::Io(_) => {
                ErrorClassification::Permanent
            }
        }
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err.classification {
            ErrorClassification::Transient => Error::Http(err.message),
            ErrorClassification::Authentication => Error::InvalidCredentials(err.message),
            ErrorClassification::Unavailable => Error::Unavailable(err.message),
            ErrorClassification::Permanent => Error::TokenExchange(err.message),
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
