pub mod error;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod sink;
pub mod types;
pub mod worker;

pub use error::PipelineError;
pub use health::{Dependency, HealthProbe, HealthReport};
pub use metrics::PipelineMetrics;
pub use queue::{
    AckMode, AmqpQueueClient, MemoryBroker, QueueClient, QueueHandle, QueueMessage, QueueSettings,
    SubscribeOptions, Subscription,
};
pub use retry::{Disposition, RetryPolicy, RetryStrategy};
pub use sink::{MemorySink, PersistedRecord, PgSink, RecordId, RecordSink};
pub use types::LogRecord;
pub use worker::{PersistenceWorker, WorkerConfig};
