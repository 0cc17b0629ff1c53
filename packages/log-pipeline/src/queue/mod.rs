//! Durable queue abstraction between the ingress and the persistence worker.
//!
//! - [`AmqpQueueClient`]: RabbitMQ over AMQP 0-9-1 with publisher confirms
//! - [`MemoryBroker`]: in-process broker with the same ack semantics, used by
//!   tests and local runs

mod amqp;
mod memory;

pub use amqp::AmqpQueueClient;
pub use memory::MemoryBroker;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::PipelineError;
use crate::types::LogRecord;

/// Header carrying how many times a message has been requeued by a worker.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Declaration settings for a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    pub name: String,
    pub durable: bool,
    /// Queue that receives rejected messages, if any.
    pub dead_letter: Option<String>,
}

impl QueueSettings {
    /// A durable queue with a companion `<name>.dead-letter` queue.
    pub fn durable(name: impl Into<String>) -> Self {
        let name = name.into();
        let dead_letter = Some(format!("{name}.dead-letter"));
        Self {
            name,
            durable: true,
            dead_letter,
        }
    }
}

/// Proof that a queue was declared; required for publish and subscribe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueHandle {
    settings: QueueSettings,
}

impl QueueHandle {
    pub(crate) fn new(settings: QueueSettings) -> Self {
        Self { settings }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn dead_letter(&self) -> Option<&str> {
        self.settings.dead_letter.as_deref()
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckMode {
    /// The consumer acknowledges each message explicitly.
    Manual,
    /// The broker forgets the message as soon as it is sent; lost on consumer crash.
    Auto,
}

#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    pub ack_mode: AckMode,
    /// Maximum unacknowledged deliveries held by the subscriber. Zero means unbounded.
    pub prefetch: u16,
    pub consumer_tag: String,
}

impl SubscribeOptions {
    pub fn manual(prefetch: u16, consumer_tag: impl Into<String>) -> Self {
        Self {
            ack_mode: AckMode::Manual,
            prefetch,
            consumer_tag: consumer_tag.into(),
        }
    }
}

/// Lazily produced deliveries. The stream ends when the underlying session is
/// lost; subscribe again to resume.
pub type Subscription = BoxStream<'static, Result<QueueMessage, PipelineError>>;

/// Broker-side settlement of a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), PipelineError>;

    /// Return the message to the queue as requeue number `attempt`.
    async fn requeue(&self, record: &LogRecord, attempt: u32) -> Result<(), PipelineError>;

    async fn dead_letter(&self, reason: &str) -> Result<(), PipelineError>;
}

/// A delivered [`LogRecord`] plus the information needed to settle it.
///
/// Settling consumes the message, so a delivery tag can only be settled once.
pub struct QueueMessage {
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Number of times this message was requeued by a worker.
    pub attempt: u32,
    pub record: LogRecord,
    acker: Arc<dyn Acknowledger>,
}

impl std::fmt::Debug for QueueMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMessage")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("attempt", &self.attempt)
            .field("payload_len", &self.record.len())
            .finish()
    }
}

impl QueueMessage {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        attempt: u32,
        record: LogRecord,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            attempt,
            record,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), PipelineError> {
        self.acker.ack().await
    }

    pub async fn requeue(self) -> Result<(), PipelineError> {
        self.acker.requeue(&self.record, self.attempt + 1).await
    }

    pub async fn dead_letter(self, reason: &str) -> Result<(), PipelineError> {
        self.acker.dead_letter(reason).await
    }
}

/// Acknowledger for auto-ack subscriptions: the broker already settled the delivery.
pub(crate) struct SettledOnSend;

#[async_trait]
impl Acknowledger for SettledOnSend {
    async fn ack(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn requeue(&self, _record: &LogRecord, _attempt: u32) -> Result<(), PipelineError> {
        tracing::warn!("requeue requested on an auto-ack delivery; message already settled");
        Ok(())
    }

    async fn dead_letter(&self, _reason: &str) -> Result<(), PipelineError> {
        tracing::warn!("dead-letter requested on an auto-ack delivery; message already settled");
        Ok(())
    }
}

/// Durable FIFO with acknowledgment semantics.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Idempotently declare `settings.name` (and its dead-letter queue).
    async fn declare_queue(&self, settings: &QueueSettings) -> Result<QueueHandle, PipelineError>;

    /// Publish and wait for the broker's confirmation.
    async fn publish(&self, queue: &QueueHandle, record: &LogRecord) -> Result<(), PipelineError>;

    async fn subscribe(
        &self,
        queue: &QueueHandle,
        options: SubscribeOptions,
    ) -> Result<Subscription, PipelineError>;

    /// Cheap reachability check used by health probes.
    async fn ping(&self) -> Result<(), PipelineError>;

    async fn close(&self);
}
