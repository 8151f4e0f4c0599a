//! Authenticated facade over the account API
//!
//! Every remote operation goes through `Session::call`, which fetches a valid
//! credential first and, when the remote rejects it, forces one refresh and
//! retries exactly once. Balance and restrictions are cached in `Reloadable`s
//! fed through `call`; each successful recomputation that differs from the
//! previous value is published on the event registry.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use auth::{Credential, CredentialManager};
use futures_util::TryStreamExt;
use remote::{Classified, ErrorClassification, Page, PagedSequence};
use resilience::{Reloadable, Workers};
use tracing::{Instrument, debug, info_span, warn};

use crate::api::{AccountApi, Balance, Restrictions, Transaction};
use crate::config::PollingConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventRegistry};
use crate::metrics;

/// Who the daemon acts for. Built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub username: String,
    pub display_name: String,
    pub dry_run: bool,
}

type CallFuture<'a, T> = Pin<Box<dyn Future<Output = remote::Result<T>> + Send + 'a>>;

type PageFuture = Pin<Box<dyn Future<Output = Result<Page<Transaction>>> + Send>>;

struct Session {
    identity: SessionIdentity,
    credentials: Arc<CredentialManager>,
    api: Arc<dyn AccountApi>,
}

impl Session {
    /// Run `op` with a valid credential, retrying once with a refreshed
    /// credential if the remote rejects the first one.
    async fn call<T, F>(&self, operation: &'static str, op: F) -> Result<T>
    where
        T: Send,
        F: for<'a> Fn(&'a dyn AccountApi, &'a Credential) -> CallFuture<'a, T> + Send + Sync,
    {
        let span = info_span!(
            "remote_call",
            call_id = %uuid::Uuid::new_v4().as_simple(),
            operation,
            username = %self.identity.username,
        );
        async {
            let started = Instant::now();
            let result = self.attempt(&op).await;
            let outcome = match &result {
                Ok(_) => "success",
                Err(e) => e.classification().label(),
            };
            metrics::record_remote_call(operation, outcome, started.elapsed().as_secs_f64());
            if let Err(e) = &result {
                debug!(error = %e, "remote call failed");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn attempt<T, F>(&self, op: &F) -> Result<T>
    where
        F: for<'a> Fn(&'a dyn AccountApi, &'a Credential) -> CallFuture<'a, T>,
    {
        let credential = self.credentials.get_credential().await?;
        match op(self.api.as_ref(), credential.as_ref()).await {
            Err(e) if e.classification() == ErrorClassification::Authentication => {
                warn!(error = %e, "credential rejected, refreshing and retrying once");
                let fresh = self.credentials.force_refresh(&credential).await?;
                Ok(op(self.api.as_ref(), fresh.as_ref()).await?)
            }
            result => Ok(result?),
        }
    }
}

/// Fires `make(previous, current)` whenever a computed value differs from
/// the last one seen.
fn publish_changes<T>(
    events: Arc<EventRegistry>,
    make: fn(Option<T>, T) -> Event,
) -> impl Fn(&T) + Send + Sync + 'static
where
    T: Clone + PartialEq + Send + 'static,
{
    let last = Mutex::new(None::<T>);
    move |value: &T| {
        let mut last = last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.as_ref() != Some(value) {
            let previous = last.replace(value.clone());
            events.fire(&make(previous, value.clone()));
        }
    }
}

pub struct Tenant {
    session: Arc<Session>,
    events: Arc<EventRegistry>,
    balance: Reloadable<Balance, Error>,
    restrictions: Reloadable<Restrictions, Error>,
    page_size: u32,
}

impl Tenant {
    pub fn new(
        identity: SessionIdentity,
        credentials: Arc<CredentialManager>,
        api: Arc<dyn AccountApi>,
        events: Arc<EventRegistry>,
        workers: Workers,
        polling: &PollingConfig,
    ) -> Self {
        let session = Arc::new(Session {
            identity,
            credentials,
            api,
        });

        let balance = Reloadable::builder("balance", {
            let session = session.clone();
            move || {
                let session = session.clone();
                async move { session.call("balance", |api, c| api.balance(c)).await }
            }
        })
        .ttl(Duration::from_secs(polling.balance_ttl_secs))
        .finisher(publish_changes(events.clone(), |previous, current| {
            Event::BalanceChanged { previous, current }
        }))
        .workers(workers.clone())
        .build();

        let restrictions = Reloadable::builder("restrictions", {
            let session = session.clone();
            move || {
                let session = session.clone();
                async move {
                    session
                        .call("restrictions", |api, c| api.restrictions(c))
                        .await
                }
            }
        })
        .ttl(Duration::from_secs(polling.restrictions_ttl_secs))
        .finisher(publish_changes(events.clone(), |_, restrictions| {
            Event::RestrictionsChanged { restrictions }
        }))
        .workers(workers)
        .build();

        Self {
            session,
            events,
            balance,
            restrictions,
            page_size: polling.page_size,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.session.identity
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.session.credentials
    }

    pub async fn balance(&self) -> Result<Balance> {
        self.balance.get().await
    }

    /// Last known balance; starts a background refresh when stale.
    pub fn balance_now(&self) -> Option<Balance> {
        self.balance.get_now()
    }

    /// Last known balance. Never contacts the remote.
    pub fn cached_balance(&self) -> Option<Balance> {
        self.balance.peek()
    }

    pub async fn restrictions(&self) -> Result<Restrictions> {
        self.restrictions.get().await
    }

    pub fn restrictions_now(&self) -> Option<Restrictions> {
        self.restrictions.get_now()
    }

    /// Kick stale caches without waiting.
    ///
    /// Fails only when the last computation of either cache hit an error
    /// retrying cannot fix; anything else is picked up by the next poll.
    pub fn poll(&self) -> Result<()> {
        self.balance_now();
        self.restrictions_now();

        for err in [self.balance.last_error(), self.restrictions.last_error()]
            .into_iter()
            .flatten()
        {
            match err.classification() {
                ErrorClassification::Permanent => return Err(err),
                classification => {
                    warn!(error = %err, %classification, "account poll failed, retrying next run")
                }
            }
        }
        Ok(())
    }

    /// Lazily paged view over the account's transactions. Each page is
    /// fetched through `call`.
    pub fn transactions(
        &self,
    ) -> PagedSequence<impl Fn(u32, u32) -> PageFuture + Send + Sync + 'static> {
        let session = self.session.clone();
        PagedSequence::new(self.page_size, move |page, size| -> PageFuture {
            let session = session.clone();
            Box::pin(async move {
                session
                    .call("transactions", move |api, c| api.transactions(c, page, size))
                    .await
            })
        })
    }

    /// Walk every transaction page and publish the count.
    pub async fn sync_transactions(&self) -> Result<u64> {
        let sequence = self.transactions();
        let count = sequence
            .stream()
            .try_fold(0u64, |count, _| async move { Ok(count + 1) })
            .await?;
        self.events.fire(&Event::TransactionsSynced { count });
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventListener;
    use crate::testing::{FakeAccounts, FakeAuth, credential_manager};
    use futures_util::StreamExt;
    use remote::RemoteError;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Event>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: &Event) {
            self.seen.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn seen(&self) -> Vec<Event> {
            self.seen.lock().unwrap().clone()
        }
    }

    struct Fixture {
        tenant: Tenant,
        auth: Arc<FakeAuth>,
        accounts: Arc<FakeAccounts>,
        recorder: Arc<Recorder>,
    }

    fn fixture(transactions: usize, page_size: u32) -> Fixture {
        let auth = Arc::new(FakeAuth::default());
        let accounts = Arc::new(FakeAccounts::new(transactions));
        let events = Arc::new(EventRegistry::new());
        let recorder = Arc::new(Recorder::default());
        events.register(recorder.clone());

        let polling = PollingConfig {
            page_size,
            ..PollingConfig::default()
        };
        let tenant = Tenant::new(
            SessionIdentity {
                username: "alice".into(),
                display_name: "Alice".into(),
                dry_run: true,
            },
            credential_manager(auth.clone()),
            accounts.clone(),
            events,
            Workers::new(2),
            &polling,
        );
        Fixture {
            tenant,
            auth,
            accounts,
            recorder,
        }
    }

    async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
        for _ in 0..200 {
            if let Some(value) = check() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn call_logs_in_lazily() {
        let f = fixture(0, 10);
        assert_eq!(f.auth.logins(), 0);

        let balance = f.tenant.balance().await.unwrap();

        assert_eq!(balance.available, 1_000);
        assert_eq!(f.auth.logins(), 1);
        assert_eq!(f.accounts.tokens(), vec!["at_login_1"]);
    }

    #[tokio::test]
    async fn rejected_credential_is_refreshed_and_retried_once() {
        let f = fixture(0, 10);
        f.accounts
            .fail_next(RemoteError::authentication("token revoked"));

        let balance = f.tenant.balance().await.unwrap();

        assert_eq!(balance.available, 1_000);
        assert_eq!(f.auth.refreshes(), 1);
        assert_eq!(f.accounts.tokens(), vec!["at_login_1", "at_refresh_1"]);
    }

    #[tokio::test]
    async fn second_rejection_is_returned() {
        let f = fixture(0, 10);
        f.accounts.fail_next(RemoteError::authentication("revoked"));
        f.accounts.fail_next(RemoteError::authentication("still revoked"));

        let err = f.tenant.balance().await.unwrap_err();

        assert_eq!(err.classification(), ErrorClassification::Authentication);
        assert_eq!(f.accounts.calls(), 2);
        assert_eq!(f.auth.refreshes(), 1);
    }

    #[tokio::test]
    async fn unavailable_propagates_without_refresh() {
        let f = fixture(0, 10);
        f.accounts.fail_next(RemoteError::unavailable("maintenance"));

        let err = f
            .tenant
            .session
            .call("restrictions", |api, c| api.restrictions(c))
            .await
            .unwrap_err();

        assert_eq!(err.classification(), ErrorClassification::Unavailable);
        assert_eq!(f.accounts.calls(), 1);
        assert_eq!(f.auth.refreshes(), 0);
    }

    #[tokio::test]
    async fn login_failure_surfaces_as_auth_error() {
        let auth = Arc::new(
            FakeAuth::default()
                .failing_login(auth::Error::InvalidCredentials("bad password".into())),
        );
        let tenant = Tenant::new(
            SessionIdentity {
                username: "alice".into(),
                display_name: "alice".into(),
                dry_run: false,
            },
            credential_manager(auth),
            Arc::new(FakeAccounts::new(0)),
            Arc::new(EventRegistry::new()),
            Workers::new(1),
            &PollingConfig::default(),
        );

        let err = tenant.balance().await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)), "got {err:?}");
        assert_eq!(err.classification(), ErrorClassification::Authentication);
    }

    #[tokio::test]
    async fn balance_is_cached_and_published_once() {
        let f = fixture(0, 10);

        f.tenant.balance().await.unwrap();
        f.tenant.balance().await.unwrap();

        assert_eq!(f.accounts.calls(), 1);
        assert_eq!(
            f.recorder.seen(),
            vec![Event::BalanceChanged {
                previous: None,
                current: crate::testing::balance(1_000),
            }]
        );
    }

    #[tokio::test]
    async fn balance_now_refreshes_in_background() {
        let f = fixture(0, 10);

        assert_eq!(f.tenant.balance_now(), None);
        let balance = eventually(|| f.tenant.balance_now()).await;

        assert_eq!(balance.available, 1_000);
        assert_eq!(f.accounts.calls(), 1);
    }

    #[tokio::test]
    async fn changed_balance_publishes_previous_and_current() {
        let f = fixture(0, 10);
        f.tenant.balance().await.unwrap();

        f.accounts.set_balance(800);
        f.tenant.balance.clear();
        f.tenant.balance().await.unwrap();

        let seen = f.recorder.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[1],
            Event::BalanceChanged {
                previous: Some(crate::testing::balance(1_000)),
                current: crate::testing::balance(800),
            }
        );
    }

    #[tokio::test]
    async fn poll_fails_only_on_permanent_errors() {
        let f = fixture(0, 10);
        f.accounts.fail_next(RemoteError::transient("reset"));
        assert!(f.tenant.balance().await.is_err());
        assert!(f.tenant.poll().is_ok());
        eventually(|| f.tenant.balance_now()).await;

        let f = fixture(0, 10);
        f.accounts.fail_next(RemoteError::permanent("404 not found"));
        assert!(f.tenant.balance().await.is_err());
        let err = f.tenant.poll().unwrap_err();
        assert_eq!(err.classification(), ErrorClassification::Permanent);
    }

    #[tokio::test]
    async fn transactions_stream_every_page() {
        let f = fixture(5, 2);

        let ids: Vec<u64> = f
            .tenant
            .transactions()
            .stream()
            .map(|t| t.unwrap().id)
            .collect()
            .await;

        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(f.accounts.calls(), 3);
    }

    #[tokio::test]
    async fn transaction_page_error_ends_the_stream() {
        let f = fixture(5, 2);
        let sequence = f.tenant.transactions();
        let mut stream = std::pin::pin!(sequence.stream());

        assert_eq!(stream.next().await.unwrap().unwrap().id, 0);
        assert_eq!(stream.next().await.unwrap().unwrap().id, 1);
        f.accounts.fail_next(RemoteError::permanent("bad page"));
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn sync_transactions_counts_and_publishes() {
        let f = fixture(7, 3);

        assert_eq!(f.tenant.sync_transactions().await.unwrap(), 7);
        assert_eq!(
            f.recorder.seen(),
            vec![Event::TransactionsSynced { count: 7 }]
        );
    }
}
