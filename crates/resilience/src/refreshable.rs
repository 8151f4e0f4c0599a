//! Probe-driven values with change notification
//!
//! A `Refreshable` asks a cheap probe for a fingerprint of its source first
//! and only runs the expensive load when the fingerprint changed. Listeners
//! hear about the first value, every change, and the source disappearing.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::scheduler::{Scheduler, TaskHandle, Timing};

type ProbeFuture<E> = Pin<Box<dyn Future<Output = std::result::Result<Option<String>, E>> + Send>>;
type LoadFuture<T, E> = Pin<Box<dyn Future<Output = std::result::Result<T, E>> + Send>>;

/// Receives value transitions of a `Refreshable`. All methods default to
/// doing nothing.
pub trait RefreshListener<T>: Send + Sync {
    fn value_set(&self, _value: &T) {}

    fn value_changed(&self, _old: &T, _new: &T) {}

    fn value_unset(&self, _old: &T) {}
}

/// What a single `refresh()` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Unchanged,
    Set,
    Changed,
    Unset,
}

struct Current<T> {
    fingerprint: Option<String>,
    value: Option<T>,
}

pub struct Refreshable<T, E> {
    name: String,
    probe: Box<dyn Fn() -> ProbeFuture<E> + Send + Sync>,
    load: Box<dyn Fn(String) -> LoadFuture<T, E> + Send + Sync>,
    current: Mutex<Current<T>>,
    listeners: RwLock<Vec<Arc<dyn RefreshListener<T>>>>,
}

impl<T, E> Refreshable<T, E>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    E: fmt::Display + Send + 'static,
{
    /// `probe` returns a fingerprint of the source, or `None` if it is gone.
    /// `load` computes the value for a fingerprint.
    pub fn new<P, PF, L, LF>(name: impl Into<String>, probe: P, load: L) -> Self
    where
        P: Fn() -> PF + Send + Sync + 'static,
        PF: Future<Output = std::result::Result<Option<String>, E>> + Send + 'static,
        L: Fn(String) -> LF + Send + Sync + 'static,
        LF: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        Self {
            name: name.into(),
            probe: Box::new(move || -> ProbeFuture<E> { Box::pin(probe()) }),
            load: Box::new(move |fingerprint| -> LoadFuture<T, E> { Box::pin(load(fingerprint)) }),
            current: Mutex::new(Current {
                fingerprint: None,
                value: None,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_listener(&self, listener: Arc<dyn RefreshListener<T>>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Value as of the last refresh.
    pub async fn get(&self) -> Option<T> {
        self.current.lock().await.value.clone()
    }

    /// Probe the source and reload if its fingerprint changed.
    ///
    /// A failing probe or load keeps the previous value and fingerprint, so
    /// the next refresh tries again.
    pub async fn refresh(&self) -> std::result::Result<RefreshOutcome, E> {
        let mut current = self.current.lock().await;

        let Some(fingerprint) = (self.probe)().await? else {
            current.fingerprint = None;
            return Ok(match current.value.take() {
                Some(old) => {
                    info!(source = %self.name, "source removed");
                    self.notify(|l| l.value_unset(&old));
                    RefreshOutcome::Unset
                }
                None => RefreshOutcome::Unchanged,
            });
        };

        if current.fingerprint.as_deref() == Some(fingerprint.as_str()) {
            debug!(source = %self.name, "source unchanged");
            return Ok(RefreshOutcome::Unchanged);
        }

        let new = (self.load)(fingerprint.clone()).await?;
        current.fingerprint = Some(fingerprint);
        let outcome = match current.value.replace(new.clone()) {
            None => {
                self.notify(|l| l.value_set(&new));
                RefreshOutcome::Set
            }
            Some(old) if old != new => {
                self.notify(|l| l.value_changed(&old, &new));
                RefreshOutcome::Changed
            }
            Some(_) => RefreshOutcome::Unchanged,
        };
        if outcome != RefreshOutcome::Unchanged {
            info!(source = %self.name, ?outcome, "source reloaded");
        }
        Ok(outcome)
    }

    /// Refresh on the scheduler per `timing`.
    ///
    /// Refresh errors are logged and retried on the next run; the task only
    /// fails if the refresh panics.
    pub fn schedule(self: &Arc<Self>, scheduler: &Scheduler, timing: Timing) -> Result<TaskHandle> {
        let this = Arc::clone(self);
        scheduler.schedule(format!("refresh:{}", self.name), timing, move || {
            let this = this.clone();
            async move {
                if let Err(e) = this.refresh().await {
                    warn!(
                        source = %this.name,
                        error = %e,
                        "refresh failed, keeping previous value"
                    );
                }
                Ok::<(), std::convert::Infallible>(())
            }
        })
    }

    fn notify(&self, event: impl Fn(&dyn RefreshListener<T>)) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            event(listener.as_ref());
        }
    }
}
