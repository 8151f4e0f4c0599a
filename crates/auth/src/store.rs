//! Persistence of the current credential across restarts
//!
//! `SecretStore` is the pluggable boundary the credential manager writes to
//! after every successful login or refresh. `FileSecretStore` keeps a JSON
//! file mapping usernames to credentials. All writes use atomic temp-file +
//! rename to prevent corruption on crash, and a tokio Mutex serializes them.
//!
//! One `FileSecretStore` instance should own a given file; two instances
//! writing the same path would overwrite each other's accounts.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::credential::Credential;
use crate::error::{Error, Result};

/// Where the credential manager persists credentials.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn SecretStore>`).
pub trait SecretStore: Send + Sync {
    /// Load the stored credential, if any.
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<Credential>>> + Send + '_>>;

    /// Replace the stored credential.
    fn save<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// JSON file store keyed by username.
pub struct FileSecretStore {
    path: PathBuf,
    account: String,
    state: Mutex<HashMap<String, Credential>>,
}

impl FileSecretStore {
    /// Open the store at `path` for `account`.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start). The first
    /// login will then populate it.
    pub async fn open(path: PathBuf, account: impl Into<String>) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading secret store: {e}")))?;
            let credentials: HashMap<String, Credential> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing secret store: {e}")))?;
            info!(path = %path.display(), accounts = credentials.len(), "opened secret store");
            credentials
        } else {
            info!(path = %path.display(), "secret store not found, starting empty");
            let store = HashMap::new();
            write_atomic(&path, &store).await?;
            store
        };

        Ok(Self {
            path,
            account: account.into(),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretStore for FileSecretStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<Credential>>> + Send + '_>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.get(&self.account).cloned())
        })
    }

    fn save<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.insert(self.account.clone(), credential.clone());
            debug!(account = %self.account, "saved credential");
            write_atomic(&self.path, &state).await
        })
    }
}

/// Write the credential map to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, Credential>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("secret store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".secrets.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp secret file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting secret file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp secret file: {e}")))?;

    debug!(path = %path.display(), "persisted secret store");
    Ok(())
}
