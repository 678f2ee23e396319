//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    // A second call (tests, embedded use) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Initialize the Prometheus exporter on `listen_addr` (e.g. `127.0.0.1:9464`).
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

// ---------------------------------------------------------------------------
// Access layer
// ---------------------------------------------------------------------------

/// `kind` is one of `conn`, `stmt`, `appender`; `event` is `open` or `close`.
pub fn record_resource_event(kind: &str, event: &str) {
    metrics::counter!(
        "strata_resource_events_total",
        "kind" => kind.to_string(),
        "event" => event.to_string()
    )
    .increment(1);
}

pub fn record_resource_in_use(kind: &str, count: i64) {
    metrics::gauge!("strata_resource_in_use", "kind" => kind.to_string()).set(count as f64);
}

/// Durations for `connect_wait`, `connect_hold`, `query_exec`, `query_wait`, `query_fetch`.
pub fn record_phase_duration_us(phase: &str, duration_us: u64) {
    metrics::histogram!("strata_phase_duration_us", "phase" => phase.to_string())
        .record(duration_us as f64);
}

pub fn record_query_metrics(duration_us: u64, stmt_kind: &str, success: bool) {
    metrics::counter!("strata_queries_total", "type" => stmt_kind.to_string(), "success" => success.to_string()).increment(1);
    metrics::histogram!("strata_query_duration_us", "type" => stmt_kind.to_string())
        .record(duration_us as f64);
}

pub fn record_admission_timeout() {
    metrics::counter!("strata_admission_timeouts_total").increment(1);
}

/// Periodic sample of live sessions, busy pool workers and live append workers.
pub fn record_runtime_sample(sessions: usize, busy_workers: usize, append_workers: usize) {
    metrics::gauge!("strata_sessions").set(sessions as f64);
    metrics::gauge!("strata_worker_pool_busy").set(busy_workers as f64);
    metrics::gauge!("strata_append_workers").set(append_workers as f64);
}

pub fn record_append_batch(table: &str, success: u64, fail: u64) {
    metrics::counter!("strata_append_rows_total", "table" => table.to_string(), "result" => "success").increment(success);
    metrics::counter!("strata_append_rows_total", "table" => table.to_string(), "result" => "fail").increment(fail);
}

// ---------------------------------------------------------------------------
// RPC
// ---------------------------------------------------------------------------

pub fn record_rpc_request(method: &str, duration_us: u64, success: bool) {
    metrics::counter!("strata_rpc_requests_total", "method" => method.to_string(), "success" => success.to_string()).increment(1);
    metrics::histogram!("strata_rpc_duration_us", "method" => method.to_string())
        .record(duration_us as f64);
}

pub fn record_rpc_inflight(rows: usize, appenders: usize, sessions: usize) {
    metrics::gauge!("strata_rpc_inflight", "kind" => "rows").set(rows as f64);
    metrics::gauge!("strata_rpc_inflight", "kind" => "appender").set(appenders as f64);
    metrics::gauge!("strata_rpc_sessions").set(sessions as f64);
}

pub fn record_rpc_inflight_swept(count: usize) {
    metrics::counter!("strata_rpc_inflight_swept_total").increment(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_helpers_without_recorder() {
        // no recorder installed: every helper must be a no-op
        record_resource_event("conn", "open");
        record_resource_in_use("conn", 1);
        record_phase_duration_us("query_exec", 10);
        record_query_metrics(10, "select", true);
        record_admission_timeout();
        record_runtime_sample(1, 0, 0);
        record_append_batch("TAG", 10, 0);
        record_rpc_request("Exec", 10, true);
        record_rpc_inflight(0, 0, 0);
        record_rpc_inflight_swept(0);
    }

    #[test]
    fn test_init_metrics_rejects_bad_address() {
        assert!(init_metrics("not-an-address").is_err());
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing("info");
        init_tracing("debug");
    }
}
