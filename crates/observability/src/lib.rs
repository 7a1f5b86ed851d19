use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global tracing subscriber with a non-blocking stdout
/// writer. `RUST_LOG` wins when set; the default keeps the world at
/// info and the named service at debug. Returns the appender guard;
/// drop it only at process exit.
pub fn init_tracing(service_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{service_name}=debug")));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .try_init();

    Some(guard)
}

/// Installs the Prometheus recorder once, registers the pipeline
/// counters, and returns the render handle. Safe to call from tests and
/// the binary alike; later calls return the first handle.
pub fn init_metrics() -> PrometheusHandle {
    if let Some(handle) = PROM_HANDLE.get() {
        return handle.clone();
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("install prometheus recorder");

    describe_counters();
    let _ = PROM_HANDLE.set(handle.clone());
    handle
}

/// One description per pipeline counter so the Prometheus render carries
/// HELP lines for everything the service increments.
fn describe_counters() {
    metrics::describe_counter!("rugs_events_total", "Inbound events routed");
    metrics::describe_counter!("rugs_trades_total", "Trades newly persisted (replays excluded)");
    metrics::describe_counter!(
        "rugs_upstream_dropped_total",
        "Raw frames overwritten on ring overflow"
    );
    metrics::describe_counter!(
        "rugs_ws_slow_client_drops_total",
        "Stream subscribers evicted as slow consumers"
    );
    metrics::describe_counter!(
        "rugs_store_jobs_dropped_total",
        "Archive writes shed under store-queue pressure"
    );
}
