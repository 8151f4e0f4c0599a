//! Daemon event registry
//!
//! Built once in `main` and shared by `Arc`. Listeners are invoked
//! synchronously, in registration order, on the thread that fires the event.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::api::{Balance, Restrictions};
use crate::error::ExitReason;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    BalanceChanged {
        previous: Option<Balance>,
        current: Balance,
    },
    RestrictionsChanged {
        restrictions: Restrictions,
    },
    TransactionsSynced {
        count: u64,
    },
    StrategyChanged {
        /// Size of the new strategy in bytes
        len: usize,
    },
    StrategyRemoved,
    DaemonTerminating {
        reason: ExitReason,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::BalanceChanged { .. } => "balance_changed",
            Event::RestrictionsChanged { .. } => "restrictions_changed",
            Event::TransactionsSynced { .. } => "transactions_synced",
            Event::StrategyChanged { .. } => "strategy_changed",
            Event::StrategyRemoved => "strategy_removed",
            Event::DaemonTerminating { .. } => "daemon_terminating",
        }
    }
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

#[derive(Default)]
pub struct EventRegistry {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn fire(&self, event: &Event) {
        crate::metrics::record_event(event.name());
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            listener.on_event(event);
        }
    }
}

/// Writes every event to the log.
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_event(&self, event: &Event) {
        match event {
            Event::BalanceChanged { previous, current } => info!(
                event = event.name(),
                previous_available = previous.as_ref().map(|b| b.available),
                available = current.available,
                blocked = current.blocked,
                currency = %current.currency,
                "balance changed"
            ),
            Event::RestrictionsChanged { restrictions } => info!(
                event = event.name(),
                investing_allowed = restrictions.investing_allowed,
                minimum_amount = restrictions.minimum_amount,
                maximum_amount = restrictions.maximum_amount,
                "restrictions changed"
            ),
            Event::TransactionsSynced { count } => {
                info!(event = event.name(), count, "transactions synced")
            }
            Event::StrategyChanged { len } => {
                info!(event = event.name(), len, "strategy changed")
            }
            Event::StrategyRemoved => info!(event = event.name(), "strategy removed"),
            Event::DaemonTerminating { reason } => info!(
                event = event.name(),
                reason = reason.label(),
                exit_code = reason.code(),
                "daemon terminating"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: &Event) {
            self.seen.lock().unwrap().push(event.name().to_string());
        }
    }

    #[test]
    fn listeners_receive_events_in_order() {
        let registry = EventRegistry::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        registry.register(first.clone());
        registry.register(second.clone());

        registry.fire(&Event::StrategyRemoved);
        registry.fire(&Event::DaemonTerminating {
            reason: ExitReason::Ok,
        });

        let expected = vec!["strategy_removed", "daemon_terminating"];
        assert_eq!(*first.seen.lock().unwrap(), expected);
        assert_eq!(*second.seen.lock().unwrap(), expected);
    }

    #[test]
    fn firing_without_listeners_is_a_no_op() {
        let registry = EventRegistry::new();
        registry.fire(&Event::TransactionsSynced { count: 3 });
    }

    #[test]
    fn logging_listener_handles_every_event() {
        let balance = Balance {
            available: 100,
            blocked: 0,
            currency: "CZK".into(),
        };
        let events = [
            Event::BalanceChanged {
                previous: None,
                current: balance,
            },
            Event::RestrictionsChanged {
                restrictions: Restrictions {
                    investing_allowed: false,
                    minimum_amount: 200,
                    maximum_amount: 200,
                },
            },
            Event::TransactionsSynced { count: 0 },
            Event::StrategyChanged { len: 12 },
            Event::StrategyRemoved,
            Event::DaemonTerminating {
                reason: ExitReason::RemoteUnavailable,
            },
        ];
        for event in &events {
            LoggingListener.on_event(event);
        }
    }
}
