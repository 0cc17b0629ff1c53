use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::queue::{QueueClient, QueueHandle, QueueMessage, SubscribeOptions, Subscription};
use crate::retry::{Disposition, RetryPolicy};
use crate::sink::RecordSink;

const INITIAL_RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(250);
const MAX_RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Concurrent deliveries in flight; also the broker QoS prefetch.
    pub prefetch: u16,
    pub insert_timeout: Duration,
    pub retry: RetryPolicy,
    pub consumer_tag: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            prefetch: 8,
            insert_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            consumer_tag: "log-worker".to_string(),
        }
    }
}

/// How a single delivery was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acknowledged,
    Requeued,
    DeadLettered,
    /// The settle call itself failed; the broker redelivers once the session drops.
    Unsettled,
}

/// Consumes the log queue and appends every delivery to the sink.
///
/// Each delivery goes `Received -> Inserting -> {Acknowledged | Rejected}`.
/// The ack is only sent after the sink confirmed the insert; rejected
/// deliveries are requeued within the retry budget or dead-lettered.
#[derive(Clone)]
pub struct PersistenceWorker {
    queue: Arc<dyn QueueClient>,
    handle: QueueHandle,
    sink: Arc<dyn RecordSink>,
    config: WorkerConfig,
    metrics: Arc<PipelineMetrics>,
}

impl PersistenceWorker {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        handle: QueueHandle,
        sink: Arc<dyn RecordSink>,
        config: WorkerConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            queue,
            handle,
            sink,
            config,
            metrics,
        }
    }

    async fn subscribe(&self) -> Result<Subscription, PipelineError> {
        self.queue
            .subscribe(
                &self.handle,
                SubscribeOptions::manual(self.config.prefetch, self.config.consumer_tag.clone()),
            )
            .await
    }

    /// Run the consumption loop until `shutdown` is cancelled.
    ///
    /// The queue must have a dead-letter queue. Failing to subscribe the first
    /// time is returned as an error. Later subscription losses are retried
    /// with backoff. On shutdown no new deliveries are pulled and every
    /// in-flight delivery is settled before this returns.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        if self.handle.dead_letter().is_none() {
            return Err(PipelineError::DeadLetterMissing(self.handle.name().to_string()));
        }

        let permits = Arc::new(Semaphore::new(usize::from(self.config.prefetch.max(1))));
        let mut tasks: JoinSet<Outcome> = JoinSet::new();
        let mut subscription = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            subscribed = self.subscribe() => Some(subscribed?),
        };
        let mut backoff = INITIAL_RESUBSCRIBE_BACKOFF;

        info!(queue = %self.handle.name(), prefetch = self.config.prefetch, "Persistence worker started");

        loop {
            if subscription.is_none() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                let resubscribed = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    resubscribed = self.subscribe() => resubscribed,
                };
                match resubscribed {
                    Ok(s) => {
                        info!("Resubscribed to queue");
                        subscription = Some(s);
                        backoff = INITIAL_RESUBSCRIBE_BACKOFF;
                    }
                    Err(e) => {
                        warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Resubscribe failed");
                        backoff = (backoff * 2).min(MAX_RESUBSCRIBE_BACKOFF);
                    }
                }
                continue;
            }
            let Some(stream) = subscription.as_mut() else {
                continue;
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    let worker = self.clone();
                    let shutdown = shutdown.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        worker.process(message, &shutdown).await
                    });
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Subscription failed");
                    subscription = None;
                }
                None => {
                    warn!("Subscription ended");
                    subscription = None;
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Delivery task panicked");
                }
            }
        }

        info!(in_flight = tasks.len(), "Shutdown requested, settling in-flight deliveries");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Delivery task panicked");
            }
        }
        drop(subscription);
        info!("Persistence worker stopped");
        Ok(())
    }

    #[instrument(
        skip_all,
        fields(
            delivery_tag = message.delivery_tag,
            attempt = message.attempt,
            redelivered = message.redelivered,
        )
    )]
    pub(crate) async fn process(&self, message: QueueMessage, shutdown: &CancellationToken) -> Outcome {
        debug!(payload_size_bytes = message.record.len(), "Received delivery");

        let start = Instant::now();
        let inserted = match tokio::time::timeout(
            self.config.insert_timeout,
            self.sink.insert(&message.record),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::SinkUnavailable(format!(
                "insert timed out after {:?}",
                self.config.insert_timeout
            ))),
        };
        self.metrics
            .insert_duration
            .record(start.elapsed().as_secs_f64() * 1000.0, &[]);

        let error = match inserted {
            Ok(id) => {
                return match message.ack().await {
                    Ok(()) => {
                        self.metrics.persisted.add(1, &[]);
                        debug!(record_id = %id, "Delivery acknowledged");
                        Outcome::Acknowledged
                    }
                    Err(e) => {
                        warn!(record_id = %id, error = %e, "Ack failed after insert; delivery will be redelivered");
                        Outcome::Unsettled
                    }
                };
            }
            Err(e) => e,
        };

        match self.config.retry.decide(&error, message.attempt) {
            Disposition::Requeue { attempt, delay } => {
                warn!(
                    error = %error,
                    next_attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Insert failed, requeueing delivery"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                match message.requeue().await {
                    Ok(()) => {
                        self.metrics.requeued.add(1, &[]);
                        Outcome::Requeued
                    }
                    Err(e) => {
                        warn!(error = %e, "Requeue failed; delivery will be redelivered");
                        Outcome::Unsettled
                    }
                }
            }
            Disposition::DeadLetter { reason } => {
                error!(error = %error, reason = %reason, "Routing delivery to dead-letter queue");
                match message.dead_letter(&reason).await {
                    Ok(()) => {
                        self.metrics.record_dead_letter(error.kind());
                        Outcome::DeadLettered
                    }
                    Err(e) => {
                        warn!(error = %e, "Dead-letter failed; delivery will be redelivered");
                        Outcome::Unsettled
                    }
                }
            }
        }
    }
}
