use std::future::ready;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

pub const READS: &str = "stream_reads_total";
pub const MESSAGES_RECEIVED: &str = "stream_messages_received_total";
pub const MESSAGES_ACKED: &str = "stream_messages_acked_total";
pub const HANDLER_FAILURES: &str = "stream_handler_failures_total";
pub const CYCLES: &str = "stream_cycles_total";
pub const HANDLER_DURATION: &str = "stream_handler_duration_seconds";
pub const ROUND_DURATION: &str = "stream_round_duration_seconds";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// Intended for a Router as returned by `setup_metrics_routes`.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint to a router. Installs the global recorder, so call it once.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router.route("/metrics", get(move || ready(recorder_handle.render()))))
}

/// A router answering `/_liveness` from `liveness`, plus `/_readiness` and `/`.
pub fn health_routes(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

async fn index() -> &'static str {
    "stream worker"
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Handler and round durations, in seconds.
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}
