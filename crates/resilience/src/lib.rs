//! Failure recovery and caching primitives
//!
//! - `backoff::Backoff`: retry an operation with doubling delays inside a
//!   total time budget
//! - `scheduler::Scheduler`: recurring tasks with hang detection on a bounded
//!   `Workers` pool
//! - `reloadable::Reloadable`: memoized value invalidated by TTL or
//!   `clear()`, with a waiting `get()` and a non-blocking `get_now()`
//! - `refreshable::Refreshable`: value reloaded when a cheap probe reports a
//!   changed source, notifying `RefreshListener`s
//!
//! All time arithmetic uses `tokio::time`, so behaviour can be tested with a
//! paused clock.

pub mod backoff;
pub mod error;
pub mod refreshable;
pub mod reloadable;
pub mod scheduler;

pub use backoff::Backoff;
pub use error::{Error, Result};
pub use refreshable::{RefreshListener, RefreshOutcome, Refreshable};
pub use reloadable::{Reloadable, ReloadableBuilder};
pub use scheduler::{Scheduler, TaskHandle, TaskState, TaskStats, Timing, Workers};
