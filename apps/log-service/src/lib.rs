use anyhow::Context;
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::field::Empty;
use tracing::{Span, debug, error, info, instrument, warn};

use log_pipeline::{
    AmqpQueueClient, Dependency, HealthProbe, LogRecord, PipelineError, PipelineMetrics,
    QueueClient, QueueHandle, QueueSettings,
};

// Expose modules for use in the binaries and tests
pub mod config;
pub mod metrics;
pub mod open_telemetry;
pub mod worker;

use config::Config;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn QueueClient>,
    pub handle: QueueHandle,
    pub health: Arc<HealthProbe>,
    pub metrics: Arc<PipelineMetrics>,
    pub max_body_bytes: usize,
}

// --- Router Setup ---

pub fn create_app(state: AppState) -> Router {
    let health = state.health.clone();
    Router::new()
        .route("/log", post(log_handler).fallback(method_not_allowed))
        .route("/version", get(version_handler))
        .with_state(state)
        .merge(health_router(health))
}

/// `/health` on its own; the worker serves only this.
pub fn health_router(probe: Arc<HealthProbe>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(probe)
}

// --- Wiring ---

pub async fn connect_queue(config: &Config) -> anyhow::Result<(Arc<dyn QueueClient>, QueueHandle)> {
    let client = AmqpQueueClient::connect(&config.rabbitmq_url, config.publish_timeout)
        .await
        .context("Failed to connect to RabbitMQ")?;
    let queue: Arc<dyn QueueClient> = Arc::new(client);

    let handle = queue
        .declare_queue(&QueueSettings::durable(config.queue_name.as_str()))
        .await
        .with_context(|| format!("Failed to declare queue {}", config.queue_name))?;

    Ok((queue, handle))
}

// --- Server Lifecycle ---

pub async fn run_ingress() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let telemetry = open_telemetry::init_tracing("log-ingress")
        .context("Failed to initialize OpenTelemetry tracing")?;
    let (meter_provider, metrics) =
        metrics::init_metrics("log-ingress").context("Failed to initialize metrics")?;

    let config = Config::from_env().context("Invalid configuration")?;
    info!(queue = %config.queue_name, "Starting log ingress...");

    let (queue, handle) = connect_queue(&config).await?;
    let health = Arc::new(HealthProbe::new(
        vec![Dependency::Broker(queue.clone())],
        config.health_cache_ttl,
    ));

    let state = AppState {
        queue: queue.clone(),
        handle,
        health,
        metrics: Arc::new(metrics),
        max_body_bytes: config.max_body_bytes,
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("Failed to bind port")?;
    info!(addr = %config.listen_addr, "Listening for requests");

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let stopped = shutdown.clone();
    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(async move { stopped.cancelled().await })
        .await
        .context("Server error")?;

    queue.close().await;
    info!("Ingress stopped");

    if let Some(provider) = meter_provider {
        if let Err(e) = provider.shutdown() {
            error!(error = %e, "Failed to shutdown meter provider");
        }
    }
    telemetry.shutdown();

    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => return,
    }

    info!("Signal received, starting graceful shutdown");
    token.cancel();
}

// --- Handlers ---

#[instrument(skip_all, fields(payload_size_bytes = Empty))]
async fn log_handler(State(state): State<AppState>, body: Body) -> Response {
    let payload = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(payload) => payload,
        Err(e) => {
            let err = PipelineError::BodyRead(e.to_string());
            warn!(error = %err, "Failed to read log body");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error reading request body").into_response();
        }
    };

    Span::current().record("payload_size_bytes", payload.len());

    if payload.is_empty() {
        debug!("Rejecting empty log body");
        return (StatusCode::BAD_REQUEST, "Empty log body").into_response();
    }

    let record = LogRecord::new(payload);
    let start = Instant::now();

    match state.queue.publish(&state.handle, &record).await {
        Ok(()) => {
            state.metrics.published.add(1, &[]);
            state
                .metrics
                .publish_duration
                .record(start.elapsed().as_secs_f64() * 1000.0, &[]);
            debug!("Log record published");
            (StatusCode::ACCEPTED, "Log accepted").into_response()
        }
        Err(e) => {
            error!(error = %e, kind = e.kind(), "Failed to publish log record");
            state.metrics.record_publish_failure(e.kind());
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to process log").into_response()
        }
    }
}

async fn method_not_allowed() -> impl IntoResponse {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

async fn health_handler(State(probe): State<Arc<HealthProbe>>) -> impl IntoResponse {
    let report = probe.check().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, report.to_string())
}

async fn version_handler() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "service": env!("CARGO_PKG_NAME"),
    }))
}
