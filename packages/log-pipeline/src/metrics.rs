use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Instruments shared by the ingress and the worker.
pub struct PipelineMetrics {
    pub published: Counter<u64>,
    pub publish_failures: Counter<u64>,
    pub publish_duration: Histogram<f64>,
    pub persisted: Counter<u64>,
    pub insert_duration: Histogram<f64>,
    pub requeued: Counter<u64>,
    pub dead_lettered: Counter<u64>,
}

impl PipelineMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            published: meter
                .u64_counter("log_pipeline_published_total")
                .with_description("Log records confirmed by the broker")
                .build(),
            publish_failures: meter
                .u64_counter("log_pipeline_publish_failures_total")
                .with_description("Publishes that were not confirmed, by error kind")
                .build(),
            publish_duration: meter
                .f64_histogram("log_pipeline_publish_duration_milliseconds")
                .with_description("Time from publish to broker confirmation")
                .build(),
            persisted: meter
                .u64_counter("log_pipeline_persisted_total")
                .with_description("Log records written to the sink and acknowledged")
                .build(),
            insert_duration: meter
                .f64_histogram("log_pipeline_insert_duration_milliseconds")
                .with_description("Sink insert duration")
                .build(),
            requeued: meter
                .u64_counter("log_pipeline_requeued_total")
                .with_description("Deliveries returned to the queue for retry")
                .build(),
            dead_lettered: meter
                .u64_counter("log_pipeline_dead_lettered_total")
                .with_description("Deliveries routed to the dead-letter queue, by error kind")
                .build(),
        }
    }

    /// Instruments bound to the global meter provider (a no-op until one is installed).
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter("log-pipeline"))
    }

    pub fn record_publish_failure(&self, kind: &'static str) {
        self.publish_failures
            .add(1, &[KeyValue::new("error", kind)]);
    }

    pub fn record_dead_letter(&self, kind: &'static str) {
        self.dead_lettered.add(1, &[KeyValue::new("error", kind)]);
    }
}
