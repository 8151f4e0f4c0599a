//! Lazily computed values with time-based and explicit invalidation
//!
//! A `Reloadable` holds nothing until first read. A value goes stale when
//! its TTL elapses or when `clear()` bumps the invalidation epoch. Two read
//! paths share one recomputation discipline:
//!
//! - `get()` waits. Exactly one caller recomputes a stale value under the
//!   compute lock; callers queued behind it reuse that outcome, error
//!   included.
//! - `get_now()` never waits. It returns the last good value (or `None`) and
//!   starts at most one background recomputation per invalidation epoch.
//!
//! Computations run one at a time under the compute lock, so each applied
//! result is newer than the one it replaces. A value keeps the epoch its
//! computation started in; one started before a `clear()` lands stale. A
//! failed computation leaves the previous good value in place.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::scheduler::Workers;

type LoadFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;
type Loader<T, E> = Arc<dyn Fn() -> LoadFuture<T, E> + Send + Sync>;
type Finisher<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slot<T, E> {
    value: Option<T>,
    loaded_at: Option<Instant>,
    /// Epoch the current value was computed in
    loaded_epoch: u64,
    /// Bumped by `clear()`
    epoch: u64,
    started: u64,
    completed: u64,
    /// Outcome of the most recent computation if it failed
    last_failure: Option<E>,
    /// Epoch a background recomputation has been started for
    pending: Option<u64>,
}

impl<T: Clone, E> Slot<T, E> {
    fn empty() -> Self {
        Self {
            value: None,
            loaded_at: None,
            loaded_epoch: 0,
            epoch: 0,
            started: 0,
            completed: 0,
            last_failure: None,
            pending: None,
        }
    }

    fn is_stale(&self, ttl: Option<Duration>, now: Instant) -> bool {
        match (&self.value, self.loaded_at) {
            (Some(_), Some(loaded_at)) => {
                self.loaded_epoch != self.epoch
                    || ttl.is_some_and(|ttl| now.duration_since(loaded_at) >= ttl)
            }
            _ => true,
        }
    }

    fn fresh(&self, ttl: Option<Duration>, now: Instant) -> Option<T> {
        if self.is_stale(ttl, now) {
            None
        } else {
            self.value.clone()
        }
    }
}

struct Inner<T, E> {
    name: String,
    loader: Loader<T, E>,
    ttl: Option<Duration>,
    finisher: Option<Finisher<T>>,
    workers: Option<Workers>,
    slot: Mutex<Slot<T, E>>,
    compute: tokio::sync::Mutex<()>,
}

/// Memoized asynchronous value. Cloning shares the cache.
pub struct Reloadable<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Reloadable<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Configures a `Reloadable`.
pub struct ReloadableBuilder<T, E> {
    name: String,
    loader: Loader<T, E>,
    ttl: Option<Duration>,
    finisher: Option<Finisher<T>>,
    workers: Option<Workers>,
}

impl<T, E> ReloadableBuilder<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + fmt::Display + Send + Sync + 'static,
{
    /// Values older than `ttl` are recomputed. Without a TTL a value lives
    /// until `clear()`.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Called once with every successfully computed value.
    pub fn finisher<F>(mut self, finisher: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.finisher = Some(Arc::new(finisher));
        self
    }

    /// Pool running the recomputations started by `get_now()`.
    pub fn workers(mut self, workers: Workers) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn build(self) -> Reloadable<T, E> {
        Reloadable {
            inner: Arc::new(Inner {
                name: self.name,
                loader: self.loader,
                ttl: self.ttl,
                finisher: self.finisher,
                workers: self.workers,
                slot: Mutex::new(Slot::empty()),
                compute: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

impl<T, E> Reloadable<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + fmt::Display + Send + Sync + 'static,
{
    pub fn builder<F, Fut>(name: impl Into<String>, loader: F) -> ReloadableBuilder<T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let loader: Loader<T, E> = Arc::new(move || -> LoadFuture<T, E> { Box::pin(loader()) });
        ReloadableBuilder {
            name: name.into(),
            loader,
            ttl: None,
            finisher: None,
            workers: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.inner.ttl
    }

    /// Current value, computing it first if absent or stale.
    pub async fn get(&self) -> Result<T, E> {
        let seen = {
            let slot = self.slot();
            if let Some(value) = slot.fresh(self.inner.ttl, Instant::now()) {
                return Ok(value);
            }
            slot.completed
        };

        let _computing = self.inner.compute.lock().await;
        {
            let slot = self.slot();
            if slot.completed != seen {
                if let Some(err) = &slot.last_failure {
                    return Err(err.clone());
                }
                if let Some(value) = &slot.value {
                    return Ok(value.clone());
                }
            }
            if let Some(value) = slot.fresh(self.inner.ttl, Instant::now()) {
                return Ok(value);
            }
        }
        self.compute().await
    }

    /// Last good value without waiting.
    ///
    /// A stale value is returned as is, and one background recomputation is
    /// started unless one is already pending for the current epoch.
    pub fn get_now(&self) -> Option<T> {
        let (value, epoch) = {
            let mut slot = self.slot();
            let value = slot.value.clone();
            if !slot.is_stale(self.inner.ttl, Instant::now()) || slot.pending == Some(slot.epoch) {
                return value;
            }
            slot.pending = Some(slot.epoch);
            (value, slot.epoch)
        };

        let cache = self.clone();
        let refresh = async move { cache.refresh_in_background(epoch).await };
        let started = match &self.inner.workers {
            Some(workers) => workers.spawn(refresh).is_ok(),
            None => {
                tokio::spawn(refresh);
                true
            }
        };
        if !started {
            debug!(cache = %self.inner.name, "worker pool closed, not refreshing");
            self.finish_pending(epoch);
        }
        value
    }

    /// Mark the value stale. It stays visible to `get_now()` and `peek()`.
    pub fn clear(&self) {
        let mut slot = self.slot();
        slot.epoch += 1;
        debug!(cache = %self.inner.name, epoch = slot.epoch, "invalidated");
    }

    /// Last good value, never triggering a computation.
    pub fn peek(&self) -> Option<T> {
        self.slot().value.clone()
    }

    /// Error of the most recent computation, if it failed.
    pub fn last_error(&self) -> Option<E> {
        self.slot().last_failure.clone()
    }

    fn slot(&self) -> MutexGuard<'_, Slot<T, E>> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the loader once. Caller holds the compute lock.
    async fn compute(&self) -> Result<T, E> {
        let (ticket, epoch) = {
            let mut slot = self.slot();
            slot.started += 1;
            (slot.started, slot.epoch)
        };
        debug!(cache = %self.inner.name, ticket, "computing value");

        let result = (self.inner.loader)().await;

        {
            let mut slot = self.slot();
            slot.completed += 1;
            match &result {
                Ok(value) => {
                    slot.value = Some(value.clone());
                    slot.loaded_at = Some(Instant::now());
                    slot.loaded_epoch = epoch;
                    slot.last_failure = None;
                }
                Err(err) => slot.last_failure = Some(err.clone()),
            }
        }

        match &result {
            Ok(value) => {
                record_computation(&self.inner.name, "success");
                if let Some(finisher) = &self.inner.finisher {
                    finisher(value);
                }
            }
            Err(err) => {
                record_computation(&self.inner.name, "failure");
                warn!(
                    cache = %self.inner.name,
                    error = %err,
                    "computation failed, keeping previous value"
                );
            }
        }
        result
    }

    async fn refresh_in_background(&self, epoch: u64) {
        // Released even if the loader panics, so later reads can retry.
        let _pending = PendingGuard {
            slot: &self.inner.slot,
            epoch,
        };
        let _computing = self.inner.compute.lock().await;
        let stale = self.slot().is_stale(self.inner.ttl, Instant::now());
        if stale {
            let _ = self.compute().await;
        }
    }

    fn finish_pending(&self, epoch: u64) {
        clear_pending(&self.inner.slot, epoch);
    }
}

fn clear_pending<T, E>(slot: &Mutex<Slot<T, E>>, epoch: u64) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.pending == Some(epoch) {
        slot.pending = None;
    }
}

/// Clears the background-pending marker for `epoch` when dropped.
struct PendingGuard<'a, T, E> {
    slot: &'a Mutex<Slot<T, E>>,
    epoch: u64,
}

impl<T, E> Drop for PendingGuard<'_, T, E> {
    fn drop(&mut self) {
        clear_pending(self.slot, self.epoch);
    }
}

fn record_computation(cache: &str, outcome: &'static str) {
    metrics::counter!(
        "cache_computations_total",
        "cache" => cache.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
