//! Authenticated-session lifecycle
//!
//! `CredentialManager` hands out a currently valid credential, performing a
//! login or refresh first when needed.
//!
//! State machine:
//! - Unauthenticated → Authenticating (password login)
//! - Valid → NearingExpiry (remaining lifetime inside the refresh window)
//! - NearingExpiry → Refreshing → Valid
//! - Refreshing → Authenticating (refresh token rejected, at most once per call)
//! - Authenticating → Unauthenticated (login failed, error surfaced)
//!
//! Readers of an already valid credential only take the `current` read lock.
//! Every transition runs under the single `transition` mutex, so at most one
//! login/refresh request is in flight per manager. Callers that queued behind
//! a transition reuse its outcome (credential or error) instead of issuing
//! their own request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use common::Secret;
use remote::Classified;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::credential::{Credential, now_millis};
use crate::error::{Error, Result};
use crate::policy::RefreshWindow;
use crate::store::SecretStore;
use crate::token::AuthApi;

/// Long-lived login material for one account.
#[derive(Debug, Clone)]
pub struct Account {
    pub username: String,
    pub password: Secret<String>,
    pub scope: String,
}

/// Observable credential state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Unauthenticated,
    Authenticating,
    Valid,
    /// Inside the refresh window, or expired and not yet refreshed
    NearingExpiry,
    Refreshing,
}

impl CredentialState {
    pub fn label(&self) -> &'static str {
        match self {
            CredentialState::Unauthenticated => "unauthenticated",
            CredentialState::Authenticating => "authenticating",
            CredentialState::Valid => "valid",
            CredentialState::NearingExpiry => "nearing_expiry",
            CredentialState::Refreshing => "refreshing",
        }
    }
}

const PHASE_IDLE: u8 = 0;
const PHASE_AUTHENTICATING: u8 = 1;
const PHASE_REFRESHING: u8 = 2;

/// Bookkeeping owned by whoever holds the transition lock.
#[derive(Default)]
struct TransitionLog {
    /// Whether the secret store has been consulted yet
    restored: bool,
    /// Failure of the most recent transition, handed to queued callers
    last_failure: Option<Error>,
}

/// Obtains, refreshes, and persists the credential for one account.
pub struct CredentialManager {
    account: Account,
    api: Arc<dyn AuthApi>,
    store: Arc<dyn SecretStore>,
    window: RefreshWindow,
    current: RwLock<Option<Arc<Credential>>>,
    transition: Mutex<TransitionLog>,
    /// Completed transitions; read without the lock to detect that one
    /// finished while a caller was waiting
    completed: AtomicU64,
    phase: AtomicU8,
}

impl CredentialManager {
    pub fn new(
        account: Account,
        api: Arc<dyn AuthApi>,
        store: Arc<dyn SecretStore>,
        window: RefreshWindow,
    ) -> Self {
        Self {
            account,
            api,
            store,
            window,
            current: RwLock::new(None),
            transition: Mutex::new(TransitionLog::default()),
            completed: AtomicU64::new(0),
            phase: AtomicU8::new(PHASE_IDLE),
        }
    }

    /// Return a valid credential, logging in or refreshing first if needed.
    ///
    /// Concurrent callers never trigger two simultaneous authentication
    /// requests: later callers wait for the in-flight one and share its
    /// result.
    pub async fn get_credential(&self) -> Result<Arc<Credential>> {
        let seen = self.completed.load(Ordering::Acquire);
        if let Some(credential) = self.usable().await {
            return Ok(credential);
        }

        let mut log = self.transition.lock().await;
        if self.completed.load(Ordering::Acquire) != seen {
            if let Some(err) = &log.last_failure {
                debug!(error = %err, "reusing failure of concurrent transition");
                return Err(err.clone());
            }
            if let Some(credential) = self.current.read().await.clone() {
                return Ok(credential);
            }
        }
        if let Some(credential) = self.usable().await {
            return Ok(credential);
        }

        self.run_transition(&mut log, None).await
    }

    /// Replace `stale` after the remote service rejected it.
    ///
    /// If another caller already replaced `stale`, the newer credential is
    /// returned without a network request.
    pub async fn force_refresh(&self, stale: &Arc<Credential>) -> Result<Arc<Credential>> {
        let mut log = self.transition.lock().await;
        if let Some(current) = self.current.read().await.clone() {
            if !Arc::ptr_eq(&current, stale) {
                debug!("credential already replaced, skipping forced refresh");
                return Ok(current);
            }
        }
        self.run_transition(&mut log, Some(stale.clone())).await
    }

    /// Current state for health reporting.
    pub async fn state(&self) -> CredentialState {
        match self.phase.load(Ordering::Acquire) {
            PHASE_AUTHENTICATING => return CredentialState::Authenticating,
            PHASE_REFRESHING => return CredentialState::Refreshing,
            _ => {}
        }
        match self.current.read().await.as_ref() {
            None => CredentialState::Unauthenticated,
            Some(c) if self.window.needs_refresh(c, now_millis()) => {
                CredentialState::NearingExpiry
            }
            Some(_) => CredentialState::Valid,
        }
    }

    /// Expiry of the current credential (unix millis), if any.
    pub async fn expires_at(&self) -> Option<u64> {
        self.current.read().await.as_ref().map(|c| c.expires_at)
    }

    /// Current credential if present and outside the refresh window.
    async fn usable(&self) -> Option<Arc<Credential>> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|c| !self.window.needs_refresh(c, now_millis()))
            .cloned()
    }

    /// Run one transition under the lock and publish its outcome.
    async fn run_transition(
        &self,
        log: &mut TransitionLog,
        forced: Option<Arc<Credential>>,
    ) -> Result<Arc<Credential>> {
        let phase = PhaseReset(&self.phase);
        let result = self.transition(log, forced).await;
        drop(phase);
        log.last_failure = result.as_ref().err().cloned();
        self.completed.fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn transition(
        &self,
        log: &mut TransitionLog,
        forced: Option<Arc<Credential>>,
    ) -> Result<Arc<Credential>> {
        if !log.restored {
            log.restored = true;
            self.restore().await;
            if forced.is_none() {
                if let Some(credential) = self.usable().await {
                    return Ok(credential);
                }
            }
        }

        let current = self.current.read().await.clone();
        match current {
            Some(credential) => self.refresh_or_login(credential, forced.is_some()).await,
            None => self.login().await,
        }
    }

    /// Adopt the persisted credential, if any. Expired ones are kept too:
    /// their refresh token may still be accepted.
    async fn restore(&self) {
        match self.store.load().await {
            Ok(Some(stored)) => {
                info!(
                    username = %self.account.username,
                    expired = stored.is_expired(now_millis()),
                    "restored credential from secret store"
                );
                *self.current.write().await = Some(Arc::new(stored));
            }
            Ok(None) => debug!("no stored credential"),
            Err(e) => warn!(error = %e, "failed to load stored credential, ignoring"),
        }
    }

    async fn refresh_or_login(
        &self,
        credential: Arc<Credential>,
        forced: bool,
    ) -> Result<Arc<Credential>> {
        self.phase.store(PHASE_REFRESHING, Ordering::Release);
        match self.api.refresh(&credential).await {
            Ok(fresh) => {
                record_transition("refresh", "success");
                self.install(fresh, "refresh").await
            }
            Err(e) => {
                record_transition("refresh", "failure");
                let classification = e.classification();
                if classification.is_retryable()
                    && !forced
                    && !credential.is_expired(now_millis())
                {
                    warn!(
                        error = %e,
                        %classification,
                        "refresh failed, keeping current credential until next attempt"
                    );
                    return Ok(credential);
                }
                warn!(error = %e, %classification, "refresh failed, falling back to login");
                *self.current.write().await = None;
                self.login().await
            }
        }
    }

    async fn login(&self) -> Result<Arc<Credential>> {
        self.phase.store(PHASE_AUTHENTICATING, Ordering::Release);
        match self
            .api
            .login(
                &self.account.username,
                &self.account.password,
                &self.account.scope,
            )
            .await
        {
            Ok(fresh) => {
                record_transition("login", "success");
                self.install(fresh, "login").await
            }
            Err(e) => {
                record_transition("login", "failure");
                warn!(username = %self.account.username, error = %e, "login failed");
                Err(e)
            }
        }
    }

    /// Persist and publish a new credential. Persistence failures are logged
    /// and ignored; the in-memory credential stays usable.
    async fn install(&self, fresh: Credential, via: &str) -> Result<Arc<Credential>> {
        if let Err(e) = self.store.save(&fresh).await {
            warn!(error = %e, "failed to persist credential");
        }
        let fresh = Arc::new(fresh);
        *self.current.write().await = Some(fresh.clone());
        info!(
            username = %self.account.username,
            via,
            expires_in_secs = fresh.remaining(now_millis()).as_secs(),
            "credential acquired"
        );
        Ok(fresh)
    }
}

fn record_transition(kind: &'static str, outcome: &'static str) {
    metrics::counter!("auth_transitions_total", "kind" => kind, "outcome" => outcome).increment(1);
}

/// Returns the manager to idle when a transition ends, including when the
/// caller's future is dropped mid-request.
struct PhaseReset<'a>(&'a AtomicU8);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.store(PHASE_IDLE, Ordering::Release);
    }
}
