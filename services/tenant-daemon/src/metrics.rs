//! Prometheus metrics exposition
//!
//! Daemon-level metrics, rendered at `/metrics` together with the counters
//! the library crates record:
//!
//! - `tenant_remote_calls_total` (counter): labels `operation`, `outcome`
//! - `tenant_remote_call_duration_seconds` (histogram): label `operation`
//! - `tenant_events_total` (counter): label `event`
//! - `tenant_authenticated` (gauge): 1 while the daemon holds a credential
//!
//! From the libraries: `auth_transitions_total`, `scheduler_task_runs_total`,
//! `cache_computations_total`.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const CALL_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("tenant_remote_call_duration_seconds".to_string()),
        CALL_DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a finished remote call.
pub fn record_remote_call(operation: &'static str, outcome: &'static str, duration_secs: f64) {
    metrics::counter!("tenant_remote_calls_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
    metrics::histogram!("tenant_remote_call_duration_seconds", "operation" => operation)
        .record(duration_secs);
}

pub fn record_event(event: &'static str) {
    metrics::counter!("tenant_events_total", "event" => event).increment(1);
}

pub fn set_authenticated(authenticated: bool) {
    metrics::gauge!("tenant_authenticated").set(if authenticated { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_remote_call("balance", "success", 0.05);
        record_event("strategy_removed");
        set_authenticated(true);
    }

    /// Isolated recorder/handle pair; only one global recorder can exist per
    /// process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn remote_calls_render_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_remote_call("balance", "success", 0.042);
        record_remote_call("transactions", "unavailable", 1.5);

        let output = handle.render();
        assert!(output.contains("tenant_remote_calls_total"));
        assert!(output.contains("operation=\"balance\""));
        assert!(output.contains("outcome=\"unavailable\""));
        assert!(output.contains("tenant_remote_call_duration_seconds_bucket"));
        assert!(output.contains("le=\"30\""));
    }

    #[test]
    fn events_and_auth_gauge_render() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_event("balance_changed");
        set_authenticated(true);

        let output = handle.render();
        assert!(output.contains("tenant_events_total{event=\"balance_changed\"} 1"));
        assert!(output.contains("tenant_authenticated 1"));
    }
}
