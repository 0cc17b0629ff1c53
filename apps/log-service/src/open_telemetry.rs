use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    logs::LoggerProvider as SdkLoggerProvider,
    propagation::TraceContextPropagator,
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
};
use tracing::error;
use tracing_subscriber::{Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// OTLP collector endpoint; export is disabled when unset.
pub fn otlp_endpoint() -> Option<String> {
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .filter(|v| !v.trim().is_empty())
}

pub fn service_name(default: &str) -> String {
    std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default.to_string())
}

/// Keeps the log exporter alive until shutdown flushes it.
pub struct Telemetry {
    logger_provider: Option<SdkLoggerProvider>,
}

impl Telemetry {
    pub fn shutdown(self) {
        if let Some(provider) = self.logger_provider {
            if let Err(e) = provider.shutdown() {
                error!(error = %e, "Failed to shutdown logger provider");
            }
        }
        global::shutdown_tracer_provider();
    }
}

/// Console logging always; OTLP traces and logs when an endpoint is configured.
pub fn init_tracing(default_service: &str) -> Result<Telemetry, anyhow::Error> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "log_service=debug,log_pipeline=debug,axum=info,lapin=warn,sqlx=warn".into());

    let Some(otlp_endpoint) = otlp_endpoint() else {
        Registry::default()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        return Ok(Telemetry {
            logger_provider: None,
        });
    };

    let service_name = service_name(default_service);

    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name.clone())]);

    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter, runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource.clone())
        .build();

    // Take the tracer before the provider moves into the global slot.
    let tracer = tracer_provider.tracer(service_name);
    global::set_tracer_provider(tracer_provider);

    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let log_exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()?;

    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter, runtime::Tokio)
        .with_resource(resource)
        .build();

    let log_layer = OpenTelemetryTracingBridge::new(&logger_provider);

    Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .with(log_layer)
        .init();

    Ok(Telemetry {
        logger_provider: Some(logger_provider),
    })
}
