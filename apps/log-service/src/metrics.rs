use opentelemetry::{KeyValue, global, metrics::MeterProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
};
use std::time::Duration;

use log_pipeline::PipelineMetrics;

use crate::open_telemetry::{otlp_endpoint, service_name};

/// Pipeline instruments, exported over OTLP when an endpoint is configured.
///
/// Without an endpoint the instruments are bound to the global no-op meter and
/// no provider is returned.
pub fn init_metrics(
    default_service: &str,
) -> Result<(Option<SdkMeterProvider>, PipelineMetrics), anyhow::Error> {
    let Some(endpoint) = otlp_endpoint() else {
        return Ok((None, PipelineMetrics::global()));
    };

    let resource = Resource::new(vec![KeyValue::new(
        "service.name",
        service_name(default_service),
    )]);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .build()?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(15))
        .build();

    let provider = MeterProviderBuilder::default()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    global::set_meter_provider(provider.clone());
    let metrics = PipelineMetrics::new(&provider.meter("log-pipeline"));

    Ok((Some(provider), metrics))
}
