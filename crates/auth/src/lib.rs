//! Account authentication library
//!
//! Obtains, refreshes, and persists the credential the daemon uses to call
//! the remote account service. Standalone: no dependency on the daemon
//! binary, so it can be tested and used independently.
//!
//! Credential flow:
//! 1. `manager::CredentialManager::get_credential()` restores the stored
//!    credential via `store::SecretStore::load()` on first use
//! 2. No credential: password login through `token::AuthApi::login()`
//! 3. Inside the `policy::RefreshWindow`: `token::AuthApi::refresh()`, with a
//!    single login fallback if the refresh token is rejected
//! 4. Every new credential is persisted via `store::SecretStore::save()`

pub mod constants;
pub mod credential;
pub mod error;
pub mod manager;
pub mod policy;
pub mod store;
pub mod token;

pub use constants::*;
pub use credential::{Credential, now_millis};
pub use error::{Error, Result};
pub use manager::{Account, CredentialManager, CredentialState};
pub use policy::RefreshWindow;
pub use store::{FileSecretStore, SecretStore};
pub use token::{AuthApi, OAuthClient, TokenResponse};
