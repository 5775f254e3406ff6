//! Consume `PgQueue` batches of ad requests and persist one selection result per request.
use std::sync::Arc;

use adflow_common::health::HealthRegistry;
use adflow_common::metrics::{operational_router, serve, setup_metrics_recorder};
use adflow_common::pgqueue::PgQueue;
use adflow_common::publisher::QueuePublisher;
use adflow_common::store::PgResultStore;
use envconfig::Envconfig;
use tracing::error;
use tracing_subscriber::EnvFilter;

use adflow_worker::config::Config;
use adflow_worker::error::WorkerError;
use adflow_worker::orchestrator::BatchOrchestrator;
use adflow_worker::worker::AdSelectionWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let config = Config::init_from_env().expect("Invalid configuration:");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), config.liveness_deadline())
        .await;

    let queue = PgQueue::new(
        config.queue_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
        "adflow-worker",
    )?;
    let store = Arc::new(PgResultStore::new(
        config.results_table.as_str(),
        queue.pool().clone(),
    ));

    let results_queue =
        PgQueue::new_from_pool(config.results_queue_name.as_str(), queue.pool().clone());
    let publisher = Arc::new(QueuePublisher::new(
        results_queue,
        config.results_max_attempts,
    ));

    let orchestrator = BatchOrchestrator::new(
        config.pipeline_config(),
        config.scoring.build_policy(),
        store,
    )
    .with_publisher(publisher);

    let worker = AdSelectionWorker::new(
        &config.worker_name,
        &queue,
        orchestrator,
        config.poll_interval.0,
        config.batch_size,
        config.batch_deadline.0,
        config.visibility_timeout.0,
        config.retry_policy(),
        worker_liveness,
    );

    let recorder = setup_metrics_recorder().expect("failed to install metrics recorder");
    let router = operational_router("adflow worker", liveness, recorder);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!("failed to start serving metrics: {}", error);
        }
    });

    worker.run().await?;

    Ok(())
}
