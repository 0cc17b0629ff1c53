use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use log_pipeline::{Dependency, HealthProbe, PersistenceWorker, PgSink, RecordSink};

use crate::config::Config;
use crate::{connect_queue, health_router, metrics, open_telemetry, shutdown_signal};

/// Consumer tag unique per process, so broker dashboards can tell workers apart.
pub fn consumer_tag() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("log-worker-{host}-{}", &suffix[..8])
}

pub async fn run_worker() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let telemetry = open_telemetry::init_tracing("log-worker")
        .context("Failed to initialize OpenTelemetry tracing")?;
    let (meter_provider, metrics) =
        metrics::init_metrics("log-worker").context("Failed to initialize metrics")?;

    let config = Config::from_env().context("Invalid configuration")?;
    let database_url = config.database_url()?;
    info!(queue = %config.queue_name, prefetch = config.worker_prefetch, "Starting persistence worker...");

    let (queue, handle) = connect_queue(&config).await?;

    let sink = PgSink::connect(
        database_url,
        config.database_max_connections,
        config.insert_timeout,
    )
    .await
    .context("Failed to connect to PostgreSQL")?;
    sink.ensure_schema()
        .await
        .context("Failed to create logs table")?;
    let sink: Arc<dyn RecordSink> = Arc::new(sink);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let health_server = match config.health_addr {
        Some(addr) => {
            let probe = Arc::new(HealthProbe::new(
                vec![Dependency::Broker(queue.clone()), Dependency::Sink(sink.clone())],
                config.health_cache_ttl,
            ));
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .context("Failed to bind health port")?;
            info!(addr = %addr, "Serving health checks");
            let stopped = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, health_router(probe))
                    .with_graceful_shutdown(async move { stopped.cancelled().await })
                    .await
            }))
        }
        None => None,
    };

    let worker = PersistenceWorker::new(
        queue.clone(),
        handle,
        sink.clone(),
        config.worker_config(consumer_tag()),
        Arc::new(metrics),
    );
    let result = worker.run(shutdown.clone()).await;

    // Also stops the health server when the worker exits on its own.
    shutdown.cancel();
    if let Some(server) = health_server {
        match server.await {
            Ok(Err(e)) => error!(error = %e, "Health server failed"),
            Err(e) => error!(error = %e, "Health server task panicked"),
            Ok(Ok(())) => {}
        }
    }

    // Every in-flight delivery is settled by now.
    queue.close().await;
    sink.close().await;
    info!("Persistence worker shut down");

    if let Some(provider) = meter_provider {
        if let Err(e) = provider.shutdown() {
            error!(error = %e, "Failed to shutdown meter provider");
        }
    }
    telemetry.shutdown();

    result.context("Persistence worker failed")
}
