use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::debug;

use super::{
    AckMode, Acknowledger, QueueClient, QueueHandle, QueueMessage, QueueSettings, SettledOnSend,
    SubscribeOptions, Subscription,
};
use crate::error::PipelineError;
use crate::types::LogRecord;

const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct Stored {
    record: LogRecord,
    attempt: u32,
    redelivered: bool,
}

struct QueueState {
    settings: QueueSettings,
    ready: VecDeque<Stored>,
    /// Keyed by (session id, delivery tag).
    unacked: HashMap<(u64, u64), Stored>,
}

impl QueueState {
    fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
        }
    }

    fn held_by(&self, session: u64) -> usize {
        self.unacked.keys().filter(|(s, _)| *s == session).count()
    }
}

struct BrokerState {
    available: bool,
    closed: bool,
    confirm_delay: Duration,
    queues: HashMap<String, QueueState>,
    next_session: u64,
    published: u64,
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process durable FIFO with broker-style acknowledgments.
///
/// Deliveries held by a subscription that is dropped without being settled
/// go back to the head of the queue flagged as redelivered, the same way a
/// broker treats a consumer whose connection died.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
    publish_timeout: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    available: true,
                    closed: false,
                    confirm_delay: Duration::ZERO,
                    queues: HashMap::new(),
                    next_session: 0,
                    published: 0,
                }),
                notify: Notify::new(),
            }),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Simulate the broker going away (or coming back). Open subscriptions end
    /// and their unsettled deliveries are requeued once they are dropped.
    pub fn set_available(&self, available: bool) {
        self.shared.lock().available = available;
        self.shared.notify.notify_waiters();
    }

    /// Delay between receiving a publish and confirming it.
    pub fn set_confirm_delay(&self, delay: Duration) {
        self.shared.lock().confirm_delay = delay;
    }

    /// Messages waiting for delivery on `queue`, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<LogRecord> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.record.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Number of confirmed publishes since creation.
    pub fn published_count(&self) -> u64 {
        self.shared.lock().published
    }

    fn declare_locked(
        state: &mut BrokerState,
        settings: &QueueSettings,
    ) -> Result<(), PipelineError> {
        match state.queues.get(&settings.name) {
            Some(existing) if existing.settings != *settings => Err(PipelineError::QueueConflict {
                queue: settings.name.clone(),
                detail: format!(
                    "declared {:?}, requested {:?}",
                    existing.settings, settings
                ),
            }),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(settings.name.clone(), QueueState::new(settings.clone()));
                Ok(())
            }
        }
    }
}

#[async_trait]
impl QueueClient for MemoryBroker {
    async fn declare_queue(&self, settings: &QueueSettings) -> Result<QueueHandle, PipelineError> {
        let mut state = self.shared.lock();
        if !state.available || state.closed {
            return Err(PipelineError::BrokerUnavailable("broker is down".into()));
        }
        if let Some(dead_letter) = &settings.dead_letter {
            let dlq = QueueSettings {
                name: dead_letter.clone(),
                durable: settings.durable,
                dead_letter: None,
            };
            Self::declare_locked(&mut state, &dlq)?;
        }
        Self::declare_locked(&mut state, settings)?;
        Ok(QueueHandle::new(settings.clone()))
    }

    async fn publish(&self, queue: &QueueHandle, record: &LogRecord) -> Result<(), PipelineError> {
        let confirm = async {
            let delay = {
                let state = self.shared.lock();
                if !state.available || state.closed {
                    return Err(PipelineError::BrokerUnavailable("broker is down".into()));
                }
                state.confirm_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.shared.lock();
            if !state.available || state.closed {
                return Err(PipelineError::BrokerUnavailable(
                    "connection lost before confirm".into(),
                ));
            }
            let q = state.queues.get_mut(queue.name()).ok_or_else(|| {
                PipelineError::BrokerUnavailable(format!("queue '{}' not declared", queue.name()))
            })?;
            q.ready.push_back(Stored {
                record: record.clone(),
                attempt: 0,
                redelivered: false,
            });
            state.published += 1;
            Ok(())
        };

        let result = tokio::time::timeout(self.publish_timeout, confirm)
            .await
            .map_err(|_| PipelineError::PublishTimeout(self.publish_timeout))?;
        if result.is_ok() {
            self.shared.notify.notify_waiters();
        }
        result
    }

    async fn subscribe(
        &self,
        queue: &QueueHandle,
        options: SubscribeOptions,
    ) -> Result<Subscription, PipelineError> {
        let id = {
            let mut state = self.shared.lock();
            if !state.available || state.closed {
                return Err(PipelineError::BrokerUnavailable("broker is down".into()));
            }
            if !state.queues.contains_key(queue.name()) {
                return Err(PipelineError::BrokerUnavailable(format!(
                    "queue '{}' not declared",
                    queue.name()
                )));
            }
            state.next_session += 1;
            state.next_session
        };
        debug!(queue = %queue.name(), session = id, consumer = %options.consumer_tag, "Memory subscription opened");

        let session = Session {
            shared: self.shared.clone(),
            queue: queue.name().to_string(),
            id,
            ack_mode: options.ack_mode,
            prefetch: options.prefetch,
            next_tag: 0,
            lost: false,
        };

        let stream = futures::stream::unfold(session, |mut session| async move {
            let item = session.next_delivery().await?;
            Some((item, session))
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), PipelineError> {
        let state = self.shared.lock();
        if state.available && !state.closed {
            Ok(())
        } else {
            Err(PipelineError::BrokerUnavailable("broker is down".into()))
        }
    }

    async fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }
}

/// One consumer session; delivery tags are scoped to it.
struct Session {
    shared: Arc<Shared>,
    queue: String,
    id: u64,
    ack_mode: AckMode,
    prefetch: u16,
    next_tag: u64,
    lost: bool,
}

impl Session {
    async fn next_delivery(&mut self) -> Option<Result<QueueMessage, PipelineError>> {
        if self.lost {
            return None;
        }
        let shared = self.shared.clone();
        loop {
            let notified = shared.notify.notified();
            {
                let mut state = shared.lock();
                if state.closed {
                    return None;
                }
                if !state.available {
                    self.lost = true;
                    return Some(Err(PipelineError::BrokerUnavailable(
                        "connection lost".into(),
                    )));
                }
                let queue = state.queues.get_mut(&self.queue)?;
                let has_room =
                    self.prefetch == 0 || queue.held_by(self.id) < usize::from(self.prefetch);
                if has_room {
                    if let Some(stored) = queue.ready.pop_front() {
                        self.next_tag += 1;
                        let tag = self.next_tag;
                        let acker: Arc<dyn Acknowledger> = match self.ack_mode {
                            AckMode::Manual => {
                                queue.unacked.insert((self.id, tag), stored.clone());
                                Arc::new(MemoryAcker {
                                    shared: shared.clone(),
                                    queue: self.queue.clone(),
                                    session: self.id,
                                    tag,
                                })
                            }
                            AckMode::Auto => Arc::new(SettledOnSend),
                        };
                        return Some(Ok(QueueMessage::new(
                            tag,
                            stored.redelivered,
                            stored.attempt,
                            stored.record,
                            acker,
                        )));
                    }
                }
            }
            notified.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return;
        };
        let mut orphaned: Vec<(u64, Stored)> = queue
            .unacked
            .iter()
            .filter(|((session, _), _)| *session == self.id)
            .map(|((_, tag), stored)| (*tag, stored.clone()))
            .collect();
        if orphaned.is_empty() {
            return;
        }
        queue.unacked.retain(|(session, _), _| *session != self.id);
        // Highest tag first so the oldest delivery ends up at the head.
        orphaned.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, mut stored) in orphaned {
            stored.redelivered = true;
            queue.ready.push_front(stored);
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    session: u64,
    tag: u64,
}

impl MemoryAcker {
    /// Remove the delivery from the unacked set and hand it to `settle`.
    fn settle(
        &self,
        settle: impl FnOnce(&mut BrokerState, Stored),
    ) -> Result<(), PipelineError> {
        let mut state = self.shared.lock();
        if !state.available || state.closed {
            return Err(PipelineError::BrokerUnavailable("connection lost".into()));
        }
        let stored = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&(self.session, self.tag)))
            .ok_or(PipelineError::DeliveryTagUnknown(self.tag))?;
        settle(&mut state, stored);
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), PipelineError> {
        self.settle(|_, _| {})
    }

    async fn requeue(&self, record: &LogRecord, attempt: u32) -> Result<(), PipelineError> {
        let queue = self.queue.clone();
        self.settle(|state, _| {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(Stored {
                    record: record.clone(),
                    attempt,
                    redelivered: false,
                });
            }
        })
    }

    /// Without a dead-letter queue the delivery stays unacked rather than
    /// being discarded.
    async fn dead_letter(&self, reason: &str) -> Result<(), PipelineError> {
        let dead_letter = self
            .shared
            .lock()
            .queues
            .get(&self.queue)
            .and_then(|q| q.settings.dead_letter.clone())
            .ok_or_else(|| PipelineError::DeadLetterMissing(self.queue.clone()))?;
        debug!(queue = %self.queue, reason, "Routing delivery to {dead_letter}");
        self.settle(|state, stored| {
            if let Some(dead) = state.queues.get_mut(&dead_letter) {
                dead.ready.push_back(stored);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(body: &str) -> LogRecord {
        LogRecord::new(body.as_bytes().to_vec())
    }

    async fn declared(broker: &MemoryBroker) -> QueueHandle {
        broker
            .declare_queue(&QueueSettings::durable("logs"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn declare_is_idempotent() {
        let broker = MemoryBroker::new();
        let first = declared(&broker).await;
        let second = declared(&broker).await;
        assert_eq!(first, second);
        assert_eq!(first.dead_letter(), Some("logs.dead-letter"));
    }

    #[tokio::test]
    async fn declare_with_different_durability_conflicts() {
        let broker = MemoryBroker::new();
        let transient = QueueSettings {
            name: "logs".into(),
            durable: false,
            dead_letter: None,
        };
        broker.declare_queue(&transient).await.unwrap();

        let err = broker
            .declare_queue(&QueueSettings {
                name: "logs".into(),
                durable: true,
                dead_letter: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::QueueConflict { .. }));
    }

    #[tokio::test]
    async fn declare_fails_when_broker_is_down() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let err = broker
            .declare_queue(&QueueSettings::durable("logs"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BrokerUnavailable(_)));
    }

    #[tokio::test]
    async fn publish_times_out_when_confirm_is_slow() {
        let broker = MemoryBroker::new().with_publish_timeout(Duration::from_millis(20));
        let handle = declared(&broker).await;
        broker.set_confirm_delay(Duration::from_millis(200));

        let err = broker.publish(&handle, &record("{}")).await.unwrap_err();
        assert!(matches!(err, PipelineError::PublishTimeout(_)));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn delivery_tags_are_monotonic_within_a_session() {
        let broker = MemoryBroker::new();
        let handle = declared(&broker).await;
        for body in ["{\"a\":1}", "{\"a\":2}", "{\"a\":3}"] {
            broker.publish(&handle, &record(body)).await.unwrap();
        }

        let mut sub = broker
            .subscribe(&handle, SubscribeOptions::manual(0, "test"))
            .await
            .unwrap();
        let mut tags = Vec::new();
        for _ in 0..3 {
            let msg = sub.next().await.unwrap().unwrap();
            tags.push(msg.delivery_tag);
            msg.ack().await.unwrap();
        }
        assert_eq!(tags, vec![1, 2, 3]);
        assert_eq!(broker.unacked_count("logs"), 0);
    }

    #[tokio::test]
    async fn dropped_session_redelivers_unacked_messages() {
        let broker = MemoryBroker::new();
        let handle = declared(&broker).await;
        broker.publish(&handle, &record("{\"n\":1}")).await.unwrap();

        {
            let mut sub = broker
                .subscribe(&handle, SubscribeOptions::manual(1, "crashing"))
                .await
                .unwrap();
            let msg = sub.next().await.unwrap().unwrap();
            assert!(!msg.redelivered);
            assert_eq!(broker.unacked_count("logs"), 1);
        }

        assert_eq!(broker.unacked_count("logs"), 0);
        let mut sub = broker
            .subscribe(&handle, SubscribeOptions::manual(1, "recovered"))
            .await
            .unwrap();
        let msg = sub.next().await.unwrap().unwrap();
        assert!(msg.redelivered);
        assert_eq!(msg.record, record("{\"n\":1}"));
    }

    #[tokio::test]
    async fn auto_ack_forgets_message_on_send() {
        let broker = MemoryBroker::new();
        let handle = declared(&broker).await;
        broker.publish(&handle, &record("{}")).await.unwrap();

        {
            let mut sub = broker
                .subscribe(
                    &handle,
                    SubscribeOptions {
                        ack_mode: AckMode::Auto,
                        prefetch: 0,
                        consumer_tag: "auto".into(),
                    },
                )
                .await
                .unwrap();
            let _msg = sub.next().await.unwrap().unwrap();
        }

        assert!(broker.ready_messages("logs").is_empty());
        assert_eq!(broker.unacked_count("logs"), 0);
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let handle = declared(&broker).await;
        for _ in 0..3 {
            broker.publish(&handle, &record("{}")).await.unwrap();
        }

        let mut sub = broker
            .subscribe(&handle, SubscribeOptions::manual(2, "bounded"))
            .await
            .unwrap();
        let first = sub.next().await.unwrap().unwrap();
        let _second = sub.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(blocked.is_err(), "third delivery must wait for an ack");

        first.ack().await.unwrap();
        let third = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("delivery after ack")
            .unwrap()
            .unwrap();
        assert_eq!(third.delivery_tag, 3);
    }

    #[tokio::test]
    async fn requeue_and_dead_letter_route_messages() {
        let broker = MemoryBroker::new();
        let handle = declared(&broker).await;
        broker.publish(&handle, &record("{\"retry\":true}")).await.unwrap();
        broker.publish(&handle, &record("not json")).await.unwrap();

        let mut sub = broker
            .subscribe(&handle, SubscribeOptions::manual(0, "router"))
            .await
            .unwrap();
        let retry = sub.next().await.unwrap().unwrap();
        let poison = sub.next().await.unwrap().unwrap();
        retry.requeue().await.unwrap();
        poison.dead_letter("invalid json").await.unwrap();

        let again = sub.next().await.unwrap().unwrap();
        assert_eq!(again.attempt, 1);
        assert_eq!(again.record, record("{\"retry\":true}"));
        assert_eq!(
            broker.ready_messages("logs.dead-letter"),
            vec![record("not json")]
        );
    }

    #[tokio::test]
    async fn dead_letter_without_dead_letter_queue_keeps_the_delivery() {
        let broker = MemoryBroker::new();
        let handle = broker
            .declare_queue(&QueueSettings {
                name: "scratch".into(),
                durable: true,
                dead_letter: None,
            })
            .await
            .unwrap();
        broker.publish(&handle, &record("not json")).await.unwrap();

        {
            let mut sub = broker
                .subscribe(&handle, SubscribeOptions::manual(1, "no-dlq"))
                .await
                .unwrap();
            let poison = sub.next().await.unwrap().unwrap();
            let err = poison.dead_letter("invalid json").await.unwrap_err();
            assert!(matches!(err, PipelineError::DeadLetterMissing(_)));
            assert_eq!(broker.unacked_count("scratch"), 1);
        }

        assert_eq!(broker.ready_messages("scratch"), vec![record("not json")]);
    }

    #[tokio::test]
    async fn subscription_ends_after_connection_loss() {
        let broker = MemoryBroker::new();
        let handle = declared(&broker).await;
        let mut sub = broker
            .subscribe(&handle, SubscribeOptions::manual(1, "lossy"))
            .await
            .unwrap();

        broker.set_available(false);
        assert!(matches!(
            sub.next().await,
            Some(Err(PipelineError::BrokerUnavailable(_)))
        ));
        assert!(sub.next().await.is_none());
    }
}
