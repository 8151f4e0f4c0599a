//! In-memory fakes shared by the daemon's unit tests.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use auth::{
    Account, AuthApi, Credential, CredentialManager, RefreshWindow, SecretStore, now_millis,
};
use common::Secret;
use remote::{Page, RemoteError};

use crate::api::{AccountApi, Balance, Restrictions, Transaction};

/// Token endpoint issuing `at_login_N` / `at_refresh_N` credentials.
#[derive(Default)]
pub struct FakeAuth {
    logins: AtomicUsize,
    refreshes: AtomicUsize,
    login_error: Mutex<Option<auth::Error>>,
}

impl FakeAuth {
    pub fn failing_login(self, err: auth::Error) -> Self {
        *self.login_error.lock().unwrap() = Some(err);
        self
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn issue(&self, prefix: &str, n: usize, scope: &str) -> Credential {
        Credential::new(
            format!("at_{prefix}_{n}"),
            format!("rt_{prefix}_{n}"),
            scope,
            now_millis(),
            Duration::from_secs(3600),
        )
    }
}

impl AuthApi for FakeAuth {
    fn login<'a>(
        &'a self,
        _username: &'a str,
        _password: &'a Secret<String>,
        scope: &'a str,
    ) -> Pin<Box<dyn Future<Output = auth::Result<Credential>> + Send + 'a>> {
        Box::pin(async move {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(err) = self.login_error.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(self.issue("login", n, scope))
        })
    }

    fn refresh<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = auth::Result<Credential>> + Send + 'a>> {
        Box::pin(async move {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(self.issue("refresh", n, &credential.scope))
        })
    }
}

#[derive(Default)]
pub struct MemoryStore(Mutex<Option<Credential>>);

impl SecretStore for MemoryStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = auth::Result<Option<Credential>>> + Send + '_>> {
        Box::pin(async move { Ok(self.0.lock().unwrap().clone()) })
    }

    fn save<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = auth::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            *self.0.lock().unwrap() = Some(credential.clone());
            Ok(())
        })
    }
}

pub fn credential_manager(auth: Arc<FakeAuth>) -> Arc<CredentialManager> {
    Arc::new(CredentialManager::new(
        Account {
            username: "alice".into(),
            password: Secret::new("hunter2".into()),
            scope: "SCOPE_APP_WEB".into(),
        },
        auth,
        Arc::new(MemoryStore::default()),
        RefreshWindow::default(),
    ))
}

/// Account endpoints backed by plain fields. Queued failures are returned,
/// one per call, before any call succeeds.
pub struct FakeAccounts {
    pub balance: Mutex<Balance>,
    pub restrictions: Mutex<Restrictions>,
    pub transactions: Vec<Transaction>,
    failures: Mutex<VecDeque<RemoteError>>,
    calls: AtomicUsize,
    tokens: Mutex<Vec<String>>,
}

impl FakeAccounts {
    pub fn new(transactions: usize) -> Self {
        Self {
            balance: Mutex::new(balance(1_000)),
            restrictions: Mutex::new(Restrictions {
                investing_allowed: true,
                minimum_amount: 200,
                maximum_amount: 5_000,
            }),
            transactions: (0..transactions as u64)
                .map(|id| Transaction {
                    id,
                    amount: -200,
                    category: "INVESTMENT".into(),
                    date: "2024-01-31".into(),
                })
                .collect(),
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next(&self, err: RemoteError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn set_balance(&self, available: i64) {
        *self.balance.lock().unwrap() = balance(available);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Access tokens seen, in call order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    fn enter(&self, credential: &Credential) -> remote::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .lock()
            .unwrap()
            .push(credential.access.expose().clone());
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub fn balance(available: i64) -> Balance {
    Balance {
        available,
        blocked: 0,
        currency: "CZK".into(),
    }
}

type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = remote::Result<T>> + Send + 'a>>;

impl AccountApi for FakeAccounts {
    fn balance<'a>(&'a self, credential: &'a Credential) -> ApiFuture<'a, Balance> {
        Box::pin(async move {
            self.enter(credential)?;
            Ok(self.balance.lock().unwrap().clone())
        })
    }

    fn restrictions<'a>(&'a self, credential: &'a Credential) -> ApiFuture<'a, Restrictions> {
        Box::pin(async move {
            self.enter(credential)?;
            Ok(self.restrictions.lock().unwrap().clone())
        })
    }

    fn transactions<'a>(
        &'a self,
        credential: &'a Credential,
        page: u32,
        size: u32,
    ) -> ApiFuture<'a, Page<Transaction>> {
        Box::pin(async move {
            self.enter(credential)?;
            let items = self
                .transactions
                .iter()
                .skip((page * size) as usize)
                .take(size as usize)
                .cloned()
                .collect();
            Ok(Page::new(items, Some(self.transactions.len() as u64)))
        })
    }
}
