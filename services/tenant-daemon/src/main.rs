//! Tenant daemon
//!
//! Long-running process acting for one account of the remote service:
//! 1. Logs in (retrying with backoff) and keeps the credential fresh
//! 2. Polls balance and restrictions, publishing changes as events
//! 3. Periodically walks the transaction history
//! 4. Watches an optional local strategy file
//! 5. Serves `/health` and `/metrics` when configured

mod api;
mod config;
mod error;
mod events;
mod health;
mod metrics;
mod service;
mod strategy;
mod tenant;
#[cfg(test)]
mod testing;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use auth::{
    Account, Credential, CredentialManager, DEFAULT_CLIENT_SECRET, FileSecretStore, OAuthClient,
};
use common::Secret;
use remote::{Classified, ErrorClassification};
use resilience::{Backoff, Scheduler, Timing};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::HttpAccountApi;
use crate::config::Config;
use crate::error::ExitReason;
use crate::events::{Event, EventRegistry, LoggingListener};
use crate::health::HealthState;
use crate::service::{ServiceAction, ServiceEvent, ServiceState, handle_event};
use crate::strategy::StrategyEvents;
use crate::tenant::{SessionIdentity, Tenant};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting tenant-daemon");

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let (state, action) = match Config::load(&config_path) {
        Ok(config) => {
            info!(
                base_url = %config.remote.base_url,
                username = %config.account.username,
                dry_run = config.account.dry_run,
                workers = config.scheduler.workers,
                "configuration loaded"
            );
            let (state, action) =
                handle_event(ServiceState::Initializing, ServiceEvent::ConfigLoaded);
            match run(config, state, action).await {
                Ok(reason) => return exit(reason),
                Err(e) => {
                    error!(error = %format!("{e:#}"), "daemon failed");
                    return exit(ExitReason::Failure);
                }
            }
        }
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "failed to load configuration");
            handle_event(ServiceState::Initializing, ServiceEvent::ConfigInvalid)
        }
    };
    info!(?state, "stopped");
    exit(exit_reason(action))
}

fn exit(reason: ExitReason) -> ExitCode {
    info!(reason = reason.label(), exit_code = reason.code(), "exiting");
    reason.into()
}

fn exit_reason(action: ServiceAction) -> ExitReason {
    match action {
        ServiceAction::Exit { reason } => reason,
        _ => ExitReason::Failure,
    }
}

async fn run(config: Config, mut state: ServiceState, action: ServiceAction) -> Result<ExitReason> {
    if action != ServiceAction::Authenticate {
        anyhow::bail!("unexpected action after ConfigLoaded: {action:?}");
    }

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.remote.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let store = FileSecretStore::open(
        config.account.secrets_path.clone(),
        config.account.username.clone(),
    )
    .await
    .with_context(|| {
        format!(
            "failed to open secret store at {}",
            config.account.secrets_path.display()
        )
    })?;

    let oauth = OAuthClient::new(
        http.clone(),
        config.remote.token_url(),
        config.remote.client_id.clone(),
        Secret::new(DEFAULT_CLIENT_SECRET.to_string()),
    );
    let credentials = Arc::new(CredentialManager::new(
        Account {
            username: config.account.username.clone(),
            password: config.account.password.clone(),
            scope: config.account.scope.clone(),
        },
        Arc::new(oauth),
        Arc::new(store),
        config.refresh.window(),
    ));

    let events = Arc::new(EventRegistry::new());
    events.register(Arc::new(LoggingListener));

    let scheduler = Arc::new(Scheduler::new(config.scheduler.workers));
    let identity = SessionIdentity {
        username: config.account.username.clone(),
        display_name: config
            .account
            .display_name
            .clone()
            .unwrap_or_else(|| config.account.username.clone()),
        dry_run: config.account.dry_run,
    };
    let tenant = Arc::new(Tenant::new(
        identity,
        credentials.clone(),
        Arc::new(HttpAccountApi::new(http, &config.remote.base_url)),
        events.clone(),
        scheduler.workers().clone(),
        &config.polling,
    ));

    // --- Authenticating ---
    let backoff = Backoff::new(
        Duration::from_secs(config.startup.retry_initial_secs),
        Duration::from_secs(config.startup.retry_budget_secs),
    );
    let authenticated = tokio::select! {
        result = authenticate(&backoff, &credentials) => result,
        _ = shutdown_signal() => {
            let (state, action) = handle_event(state, ServiceEvent::ShutdownSignal);
            info!(?state, "shutdown requested before authentication completed");
            return Ok(exit_reason(action));
        }
    };
    let event = match authenticated {
        Ok(credential) => {
            info!(
                username = %tenant.identity().username,
                expires_at = credential.expires_at,
                "authenticated"
            );
            ServiceEvent::Authenticated
        }
        Err(e) => {
            let reason = ExitReason::for_classification(e.classification());
            error!(error = %e, reason = reason.label(), "initial authentication failed");
            ServiceEvent::AuthenticationFailed { reason }
        }
    };
    let (new_state, action) = handle_event(state, event);
    state = new_state;
    if action != ServiceAction::StartTasks {
        return Ok(exit_reason(action));
    }
    metrics::set_authenticated(true);

    // --- Running ---
    match tokio::try_join!(tenant.balance(), tenant.restrictions()) {
        Ok((balance, restrictions)) => info!(
            available = balance.available,
            currency = %balance.currency,
            investing_allowed = restrictions.investing_allowed,
            "account loaded"
        ),
        Err(e) => warn!(error = %e, "initial account load failed, polling will retry"),
    }

    let (fatal_tx, mut fatal_rx) = mpsc::channel::<ExitReason>(1);
    schedule_tasks(&config, &scheduler, &tenant, &events, fatal_tx)?;

    let health_server = match &config.health {
        Some(health) => {
            let state = HealthState {
                tenant: tenant.clone(),
                scheduler: scheduler.clone(),
                prometheus,
                started_at: Instant::now(),
            };
            Some(serve_health(state, health.listen_addr, health.max_connections).await?)
        }
        None => None,
    };
    info!(?state, tasks = scheduler.tasks().len(), "running");

    let event = tokio::select! {
        _ = shutdown_signal() => ServiceEvent::ShutdownSignal,
        Some(reason) = fatal_rx.recv() => {
            error!(reason = reason.label(), "unrecoverable task failure");
            ServiceEvent::Fatal { reason }
        }
    };

    // --- Draining ---
    let (new_state, action) = handle_event(state, event);
    state = new_state;
    let ServiceAction::Drain { reason } = action else {
        anyhow::bail!("unexpected action while running: {action:?}");
    };
    events.fire(&Event::DaemonTerminating { reason });
    scheduler.shutdown().await;
    if let Some((stop, server)) = health_server {
        let _ = stop.send(());
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "health server error during shutdown"),
            Err(e) => error!(error = %e, "health server task panicked"),
        }
    }
    metrics::set_authenticated(false);

    let (state, action) = handle_event(state, ServiceEvent::Drained);
    info!(?state, "shutdown complete");
    Ok(exit_reason(action))
}

/// Obtain the first credential.
///
/// Transient and unavailable failures are retried within the backoff budget.
/// A rejected login or a permanent failure is returned after one attempt.
async fn authenticate(
    backoff: &Backoff,
    credentials: &CredentialManager,
) -> auth::Result<Arc<Credential>> {
    backoff
        .retry_if(
            || credentials.get_credential(),
            |e| e.classification().is_retryable(),
        )
        .await
}

/// Register the recurring tasks.
fn schedule_tasks(
    config: &Config,
    scheduler: &Scheduler,
    tenant: &Arc<Tenant>,
    events: &Arc<EventRegistry>,
    fatal: mpsc::Sender<ExitReason>,
) -> Result<()> {
    let timeout = Duration::from_secs(config.scheduler.task_timeout_secs);

    // Keeps the credential out of its refresh window. Transient failures are
    // retried next run; a rejected login ends the daemon.
    let check = Duration::from_secs(config.refresh.check_interval_secs);
    let credentials = tenant.credentials().clone();
    scheduler
        .schedule(
            "credential-refresh",
            Timing::every(check, timeout).after(check),
            move || {
                let credentials = credentials.clone();
                let fatal = fatal.clone();
                async move {
                    match credentials.get_credential().await {
                        Ok(_) => Ok(()),
                        Err(e) => match e.classification() {
                            ErrorClassification::Authentication
                            | ErrorClassification::Permanent => {
                                let reason = ExitReason::for_classification(e.classification());
                                let _ = fatal.try_send(reason);
                                Err(e)
                            }
                            classification => {
                                warn!(
                                    error = %e,
                                    %classification,
                                    "credential refresh failed, retrying next run"
                                );
                                Ok(())
                            }
                        },
                    }
                }
            },
        )
        .context("failed to schedule credential refresh")?;

    let poll_tenant = tenant.clone();
    scheduler
        .schedule(
            "account-poll",
            Timing::every(Duration::from_secs(config.polling.balance_interval_secs), timeout),
            move || {
                let tenant = poll_tenant.clone();
                async move { tenant.poll() }
            },
        )
        .context("failed to schedule account poll")?;

    let sync_tenant = tenant.clone();
    scheduler
        .schedule(
            "transaction-sync",
            Timing::every(
                Duration::from_secs(config.polling.transactions_interval_secs),
                timeout,
            ),
            move || {
                let tenant = sync_tenant.clone();
                async move {
                    match tenant.sync_transactions().await {
                        Err(e) if e.classification() == ErrorClassification::Permanent => Err(e),
                        Err(e) => {
                            warn!(error = %e, "transaction sync failed, retrying next run");
                            Ok(())
                        }
                        Ok(_) => Ok(()),
                    }
                }
            },
        )
        .context("failed to schedule transaction sync")?;

    if let Some(strategy) = &config.strategy {
        let source = Arc::new(strategy::watch_file(strategy.path.clone()));
        source.register_listener(Arc::new(StrategyEvents::new(events.clone())));
        source
            .schedule(
                scheduler,
                Timing::every(Duration::from_secs(strategy.check_interval_secs), timeout),
            )
            .context("failed to schedule strategy watch")?;
        info!(path = %strategy.path.display(), "watching strategy file");
    }

    Ok(())
}

type HealthServer = (oneshot::Sender<()>, JoinHandle<std::io::Result<()>>);

/// Bind and serve the health router until the returned sender fires.
async fn serve_health(
    state: HealthState,
    addr: std::net::SocketAddr,
    max_connections: usize,
) -> Result<HealthServer> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health endpoint to {addr}"))?;
    info!(addr = %addr, "serving /health and /metrics");

    let app = health::build_router(state, max_connections);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });
    Ok((stop_tx, server))
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
