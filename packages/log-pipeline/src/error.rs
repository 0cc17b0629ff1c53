use std::time::Duration;

/// Failure taxonomy shared by the ingress, the queue client, the worker and the sink.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("publish not confirmed within {0:?}")]
    PublishTimeout(Duration),

    #[error("queue '{queue}' already exists with incompatible settings: {detail}")]
    QueueConflict { queue: String, detail: String },

    #[error("delivery tag {0} is not held by this session")]
    DeliveryTagUnknown(u64),

    #[error("queue '{0}' has no dead-letter queue; rejected deliveries would be lost")]
    DeadLetterMissing(String),

    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

impl PipelineError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// `ConstraintViolation` is deterministic for a given payload and
    /// `QueueConflict`/`DeadLetterMissing` need operator action; everything else is a
    /// connectivity problem.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            PipelineError::ConstraintViolation(_)
                | PipelineError::QueueConflict { .. }
                | PipelineError::DeadLetterMissing(_)
        )
    }

    /// Short stable name used as a metric attribute and log field.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::BodyRead(_) => "body_read",
            PipelineError::BrokerUnavailable(_) => "broker_unavailable",
            PipelineError::PublishTimeout(_) => "publish_timeout",
            PipelineError::QueueConflict { .. } => "queue_conflict",
            PipelineError::DeliveryTagUnknown(_) => "delivery_tag_unknown",
            PipelineError::DeadLetterMissing(_) => "dead_letter_missing",
            PipelineError::SinkUnavailable(_) => "sink_unavailable",
            PipelineError::ConstraintViolation(_) => "constraint_violation",
        }
    }
}

impl From<lapin::Error> for PipelineError {
    fn from(e: lapin::Error) -> Self {
        PipelineError::BrokerUnavailable(e.to_string())
    }
}
