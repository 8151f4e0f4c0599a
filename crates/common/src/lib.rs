//! Common types shared by the tenant-sync crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
