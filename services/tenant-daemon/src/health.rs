//! Health and metrics endpoint
//!
//! `/health` returns 200 while the daemon holds a credential and no recurring
//! task has failed, 503 otherwise. `/metrics` renders the Prometheus text
//! exposition format.

use std::sync::Arc;
use std::time::Instant;

use auth::{CredentialState, now_millis};
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use resilience::{Scheduler, TaskState};

use crate::tenant::Tenant;

/// Shared state accessible from all handlers
#[derive(Clone)]
pub struct HealthState {
    pub tenant: Arc<Tenant>,
    pub scheduler: Arc<Scheduler>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the router, limited to `max_connections` concurrent requests.
pub fn build_router(state: HealthState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let credentials = state.tenant.credentials();
    let credential = credentials.state().await;
    let expires_in_secs = credentials
        .expires_at()
        .await
        .map(|at| at.saturating_sub(now_millis()) / 1000);

    let handles = state.scheduler.tasks();
    let tasks: Vec<_> = handles
        .iter()
        .map(|task| {
            let stats = task.stats();
            serde_json::json!({
                "name": task.name(),
                "state": task.state().label(),
                "interval_secs": task.timing().interval.as_secs(),
                "scheduled": stats.scheduled,
                "succeeded": stats.succeeded,
                "failed": stats.failed,
                "timed_out": stats.timed_out,
                "last_error": task.last_error(),
            })
        })
        .collect();
    let failed_tasks = handles
        .iter()
        .filter(|task| task.state() == TaskState::Failed)
        .count();

    let healthy = credential != CredentialState::Unauthenticated && failed_tasks == 0;
    let identity = state.tenant.identity();
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "username": identity.username,
        "display_name": identity.display_name,
        "dry_run": identity.dry_run,
        "credential": credential,
        "credential_expires_in_secs": expires_in_secs,
        "balance": state.tenant.cached_balance().map(|b| b.available),
        "workers": state.scheduler.workers().size(),
        "idle_workers": state.scheduler.workers().idle(),
        "tasks": tasks,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
