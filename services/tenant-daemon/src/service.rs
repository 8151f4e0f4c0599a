//! Service state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (main.rs) executes the I/O implied by each action.

use crate::error::ExitReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    /// Loading config, setting up resources
    Initializing,
    /// Initial login, retried with backoff
    Authenticating,
    /// Recurring tasks scheduled
    Running,
    /// Scheduler shutting down
    Draining { reason: ExitReason },
    /// Terminal state
    Stopped { exit_code: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    ConfigLoaded,
    ConfigInvalid,
    /// First credential obtained
    Authenticated,
    /// Backoff budget spent without a credential
    AuthenticationFailed { reason: ExitReason },
    /// SIGTERM/SIGINT received
    ShutdownSignal,
    /// A recurring task hit an error the daemon cannot recover from
    Fatal { reason: ExitReason },
    /// Scheduler shutdown completed
    Drained,
}

/// Actions the caller should execute after a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAction {
    Authenticate,
    StartTasks,
    /// Shut the scheduler down and announce termination
    Drain { reason: ExitReason },
    /// Exit the process
    Exit { reason: ExitReason },
    None,
}

fn stop(reason: ExitReason) -> (ServiceState, ServiceAction) {
    (
        ServiceState::Stopped {
            exit_code: reason.code(),
        },
        ServiceAction::Exit { reason },
    )
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        // --- Initializing ---
        (ServiceState::Initializing, ServiceEvent::ConfigLoaded) => {
            (ServiceState::Authenticating, ServiceAction::Authenticate)
        }
        (ServiceState::Initializing, ServiceEvent::ConfigInvalid) => stop(ExitReason::Config),

        // --- Authenticating ---
        (ServiceState::Authenticating, ServiceEvent::Authenticated) => {
            (ServiceState::Running, ServiceAction::StartTasks)
        }
        (ServiceState::Authenticating, ServiceEvent::AuthenticationFailed { reason }) => {
            stop(reason)
        }

        // Nothing is scheduled yet, so there is nothing to drain.
        (
            ServiceState::Initializing | ServiceState::Authenticating,
            ServiceEvent::ShutdownSignal,
        ) => stop(ExitReason::Ok),

        // --- Running ---
        (ServiceState::Running, ServiceEvent::ShutdownSignal) => {
            let reason = ExitReason::Ok;
            (ServiceState::Draining { reason }, ServiceAction::Drain { reason })
        }
        (ServiceState::Running, ServiceEvent::Fatal { reason }) => {
            (ServiceState::Draining { reason }, ServiceAction::Drain { reason })
        }

        // --- Draining ---
        (ServiceState::Draining { reason }, ServiceEvent::Drained) => stop(reason),

        // Repeated signals and late failures don't restart the drain.
        (state @ ServiceState::Draining { .. }, _) => (state, ServiceAction::None),

        (state, _) => (state, ServiceAction::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_to_clean_exit() {
        let (state, action) = handle_event(ServiceState::Initializing, ServiceEvent::ConfigLoaded);
        assert_eq!(state, ServiceState::Authenticating);
        assert_eq!(action, ServiceAction::Authenticate);

        let (state, action) = handle_event(state, ServiceEvent::Authenticated);
        assert_eq!(state, ServiceState::Running);
        assert_eq!(action, ServiceAction::StartTasks);

        let (state, action) = handle_event(state, ServiceEvent::ShutdownSignal);
        assert_eq!(
            action,
            ServiceAction::Drain {
                reason: ExitReason::Ok
            }
        );

        let (state, action) = handle_event(state, ServiceEvent::Drained);
        assert_eq!(state, ServiceState::Stopped { exit_code: 0 });
        assert_eq!(
            action,
            ServiceAction::Exit {
                reason: ExitReason::Ok
            }
        );
    }

    #[test]
    fn invalid_config_exits_with_config_code() {
        let (state, action) =
            handle_event(ServiceState::Initializing, ServiceEvent::ConfigInvalid);
        assert_eq!(state, ServiceState::Stopped { exit_code: 1 });
        assert_eq!(
            action,
            ServiceAction::Exit {
                reason: ExitReason::Config
            }
        );
    }

    #[test]
    fn authentication_failure_keeps_its_reason() {
        for reason in [ExitReason::AuthenticationFailed, ExitReason::RemoteUnavailable] {
            let (state, action) = handle_event(
                ServiceState::Authenticating,
                ServiceEvent::AuthenticationFailed { reason },
            );
            assert_eq!(
                state,
                ServiceState::Stopped {
                    exit_code: reason.code()
                }
            );
            assert_eq!(action, ServiceAction::Exit { reason });
        }
    }

    #[test]
    fn signal_while_authenticating_exits_immediately() {
        let (state, action) =
            handle_event(ServiceState::Authenticating, ServiceEvent::ShutdownSignal);
        assert_eq!(state, ServiceState::Stopped { exit_code: 0 });
        assert_eq!(
            action,
            ServiceAction::Exit {
                reason: ExitReason::Ok
            }
        );
    }

    #[test]
    fn fatal_task_failure_drains_with_its_reason() {
        let reason = ExitReason::AuthenticationFailed;
        let (state, action) = handle_event(ServiceState::Running, ServiceEvent::Fatal { reason });
        assert_eq!(state, ServiceState::Draining { reason });
        assert_eq!(action, ServiceAction::Drain { reason });

        let (state, _) = handle_event(state, ServiceEvent::Drained);
        assert_eq!(state, ServiceState::Stopped { exit_code: 2 });
    }

    #[test]
    fn draining_ignores_further_signals() {
        let draining = ServiceState::Draining {
            reason: ExitReason::Ok,
        };
        let (state, action) = handle_event(draining.clone(), ServiceEvent::ShutdownSignal);
        assert_eq!(state, draining);
        assert_eq!(action, ServiceAction::None);

        let (state, action) = handle_event(
            draining.clone(),
            ServiceEvent::Fatal {
                reason: ExitReason::Failure,
            },
        );
        assert_eq!(state, draining);
        assert_eq!(action, ServiceAction::None);
    }

    #[test]
    fn stopped_is_terminal() {
        let stopped = ServiceState::Stopped { exit_code: 3 };
        let (state, action) = handle_event(stopped.clone(), ServiceEvent::ConfigLoaded);
        assert_eq!(state, stopped);
        assert_eq!(action, ServiceAction::None);
    }
}
