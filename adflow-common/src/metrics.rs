use std::future::ready;

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

/// Per-event and per-batch latencies sit well under a second.
const LATENCY_SECONDS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Emission to result includes queueing, and with retries can take minutes.
const END_TO_END_SECONDS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 150.0, 300.0];

const BATCH_SIZES: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0];

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

fn recorder_builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_SECONDS)?
        .set_buckets_for_metric(
            Matcher::Full("adflow_end_to_end_latency_seconds".to_owned()),
            END_TO_END_SECONDS,
        )?
        .set_buckets_for_metric(Matcher::Suffix("_batch_size".to_owned()), BATCH_SIZES)
}

/// Install the global Prometheus recorder.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    recorder_builder()?.install_recorder()
}

/// The worker's operational endpoints: an index, `/_liveness` and `/metrics`.
pub fn operational_router(
    name: &'static str,
    liveness: HealthRegistry,
    metrics: PrometheusHandle,
) -> Router {
    Router::new()
        .route("/", get(move || ready(name)))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/metrics", get(move || ready(metrics.render())))
}
