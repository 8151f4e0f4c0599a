//! Error types for scheduling operations

/// Errors from the scheduler and its worker pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("scheduler is shut down")]
    Closed,

    #[error("invalid task state: {0}")]
    InvalidState(String),
}

/// Result alias for scheduling operations.
pub type Result<T> = std::result::Result<T, Error>;
