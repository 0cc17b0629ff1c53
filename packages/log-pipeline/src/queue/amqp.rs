use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    AckMode, Acknowledger, QueueClient, QueueHandle, QueueMessage, QueueSettings, SettledOnSend,
    SubscribeOptions, Subscription, RETRY_COUNT_HEADER,
};
use crate::error::PipelineError;
use crate::types::{LogRecord, CONTENT_TYPE_JSON};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

struct Session {
    connection: Connection,
    /// Confirm-mode channel shared by all publishers; lapin serializes frames internally.
    publisher: Channel,
}

/// RabbitMQ client owning one connection.
///
/// The connection is opened lazily and re-opened on the next call after it
/// drops, so a subscription that ended because of a connection loss can be
/// restarted by subscribing again.
pub struct AmqpQueueClient {
    url: String,
    publish_timeout: Duration,
    /// Bound on opening the connection and its publisher channel.
    connect_timeout: Duration,
    session: RwLock<Option<Arc<Session>>>,
}

impl AmqpQueueClient {
    /// Connect eagerly so a bad URL or unreachable broker fails at startup.
    pub async fn connect(url: &str, publish_timeout: Duration) -> Result<Self, PipelineError> {
        let client = Self::lazy(url, publish_timeout);
        client.session().await?;
        Ok(client)
    }

    /// A client that opens its connection on first use.
    pub fn lazy(url: &str, publish_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            publish_timeout,
            connect_timeout: publish_timeout,
            session: RwLock::new(None),
        }
    }

    async fn session(&self) -> Result<Arc<Session>, PipelineError> {
        if let Some(session) = self.session.read().await.as_ref() {
            if session.connection.status().connected() {
                return Ok(session.clone());
            }
        }

        let mut slot = self.session.write().await;
        if let Some(session) = slot.as_ref() {
            if session.connection.status().connected() {
                return Ok(session.clone());
            }
            warn!("AMQP connection lost, reconnecting");
        }

        let open = async {
            let connection =
                Connection::connect(&self.url, ConnectionProperties::default()).await?;
            let publisher = connection.create_channel().await?;
            publisher
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
            Ok::<_, PipelineError>(Session {
                connection,
                publisher,
            })
        };
        let session = tokio::time::timeout(self.connect_timeout, open)
            .await
            .map_err(|_| {
                PipelineError::BrokerUnavailable(format!(
                    "no AMQP handshake within {:?}",
                    self.connect_timeout
                ))
            })??;
        info!("Connected to RabbitMQ");

        let session = Arc::new(session);
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn forget_session(&self) {
        self.session.write().await.take();
    }

    /// Declare on a throwaway channel: a failed declaration closes the channel.
    async fn declare_one(
        &self,
        session: &Session,
        name: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<(), PipelineError> {
        let channel = session.connection.create_channel().await?;
        let result = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await;

        match result {
            Ok(_) => {
                let _ = channel.close(REPLY_SUCCESS, "declared").await;
                Ok(())
            }
            Err(lapin::Error::ProtocolError(e))
                if matches!(
                    e.kind(),
                    AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
                ) =>
            {
                Err(PipelineError::QueueConflict {
                    queue: name.to_string(),
                    detail: e.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn dead_letter_arguments(dead_letter: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(String::new().into()),
    );
    args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(dead_letter.to_string().into()),
    );
    args
}

fn properties(attempt: u32) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(RETRY_COUNT_HEADER),
        AMQPValue::LongLongInt(i64::from(attempt)),
    );
    BasicProperties::default()
        .with_content_type(ShortString::from(CONTENT_TYPE_JSON))
        .with_delivery_mode(PERSISTENT)
        .with_headers(headers)
}

fn retry_count(properties: &BasicProperties) -> u32 {
    let Some(headers) = properties.headers().as_ref() else {
        return 0;
    };
    headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == RETRY_COUNT_HEADER)
        .and_then(|(_, value)| match value {
            AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
            AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
            AMQPValue::LongUInt(v) => Some(*v),
            AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
            AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
            _ => None,
        })
        .unwrap_or(0)
}

/// Publish on `channel` and wait for the broker's ack. Unbounded; callers
/// wrap it in a timeout.
async fn publish_and_confirm(
    channel: &Channel,
    queue: &str,
    record: &LogRecord,
    attempt: u32,
) -> Result<(), PipelineError> {
    let confirmation = channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            record.payload(),
            properties(attempt),
        )
        .await?
        .await?;
    match confirmation {
        Confirmation::Nack(_) => Err(PipelineError::BrokerUnavailable(
            "broker rejected the publish".into(),
        )),
        _ => Ok(()),
    }
}

#[async_trait]
impl QueueClient for AmqpQueueClient {
    async fn declare_queue(&self, settings: &QueueSettings) -> Result<QueueHandle, PipelineError> {
        let session = self.session().await?;

        let mut arguments = FieldTable::default();
        if let Some(dead_letter) = &settings.dead_letter {
            self.declare_one(&session, dead_letter, settings.durable, FieldTable::default())
                .await?;
            arguments = dead_letter_arguments(dead_letter);
        }
        self.declare_one(&session, &settings.name, settings.durable, arguments)
            .await?;

        info!(queue = %settings.name, durable = settings.durable, dead_letter = ?settings.dead_letter, "Queue declared");
        Ok(QueueHandle::new(settings.clone()))
    }

    /// The timeout covers waiting for (or opening) the connection as well as
    /// the confirm.
    async fn publish(&self, queue: &QueueHandle, record: &LogRecord) -> Result<(), PipelineError> {
        let attempt = async {
            let session = self.session().await?;
            let result = publish_and_confirm(&session.publisher, queue.name(), record, 0).await;
            Ok::<_, PipelineError>((session, result))
        };
        let (session, result) = tokio::time::timeout(self.publish_timeout, attempt)
            .await
            .map_err(|_| PipelineError::PublishTimeout(self.publish_timeout))??;

        if matches!(result, Err(PipelineError::BrokerUnavailable(_)))
            && !session.publisher.status().connected()
        {
            self.forget_session().await;
        }
        result
    }

    async fn subscribe(
        &self,
        queue: &QueueHandle,
        options: SubscribeOptions,
    ) -> Result<Subscription, PipelineError> {
        let session = self.session().await?;
        let channel = session.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                queue.name(),
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.ack_mode == AckMode::Auto,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(queue = %queue.name(), consumer = %options.consumer_tag, prefetch = options.prefetch, "Consumer registered");

        let queue_name = queue.name().to_string();
        let publish_timeout = self.publish_timeout;
        let ack_mode = options.ack_mode;

        let stream = consumer.map(move |delivery| -> Result<QueueMessage, PipelineError> {
            let delivery = delivery?;
            let attempt = retry_count(&delivery.properties);
            let delivery_tag = delivery.delivery_tag;
            let redelivered = delivery.redelivered;
            let acker: Arc<dyn Acknowledger> = match ack_mode {
                AckMode::Manual => Arc::new(AmqpAcker {
                    acker: delivery.acker,
                    channel: channel.clone(),
                    queue: queue_name.clone(),
                    publish_timeout,
                }),
                AckMode::Auto => Arc::new(SettledOnSend),
            };
            Ok(QueueMessage::new(
                delivery_tag,
                redelivered,
                attempt,
                LogRecord::new(delivery.data),
                acker,
            ))
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), PipelineError> {
        self.session().await.map(|_| ())
    }

    async fn close(&self) {
        if let Some(session) = self.session.write().await.take() {
            if let Err(e) = session.connection.close(REPLY_SUCCESS, "shutdown").await {
                warn!(error = %e, "Failed to close AMQP connection cleanly");
            } else {
                info!("AMQP connection closed");
            }
        }
    }
}

struct AmqpAcker {
    acker: Acker,
    channel: Channel,
    queue: String,
    publish_timeout: Duration,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), PipelineError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    /// Republish with the new retry count, then ack the original. If the
    /// copy is not confirmed, let the broker requeue the original instead.
    async fn requeue(&self, record: &LogRecord, attempt: u32) -> Result<(), PipelineError> {
        let republished = tokio::time::timeout(
            self.publish_timeout,
            publish_and_confirm(&self.channel, &self.queue, record, attempt),
        )
        .await
        .map_err(|_| PipelineError::PublishTimeout(self.publish_timeout))
        .and_then(|result| result);
        match republished {
            Ok(()) => self.ack().await,
            Err(e) => {
                warn!(error = %e, "Republish for retry failed, falling back to broker requeue");
                self.acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await?;
                Ok(())
            }
        }
    }

    async fn dead_letter(&self, reason: &str) -> Result<(), PipelineError> {
        debug!(queue = %self.queue, reason, "Rejecting delivery to dead-letter exchange");
        self.acker
            .nack(BasicNackOptions {
                requeue: false,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts TCP connections and never speaks AMQP.
    async fn silent_broker() -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        (format!("amqp://guest:guest@{addr}/%2f"), accept)
    }

    #[tokio::test]
    async fn publish_is_bounded_when_the_handshake_stalls() {
        let (url, accept) = silent_broker().await;
        let client = AmqpQueueClient::lazy(&url, Duration::from_millis(200));
        let handle = QueueHandle::new(QueueSettings::durable("logs"));

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            client.publish(&handle, &LogRecord::new(&b"{}"[..])),
        )
        .await
        .expect("publish must honour its timeout");

        assert!(matches!(
            result,
            Err(PipelineError::PublishTimeout(_) | PipelineError::BrokerUnavailable(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        accept.abort();
    }

    #[tokio::test]
    async fn connect_is_bounded_when_the_handshake_stalls() {
        let (url, accept) = silent_broker().await;

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            AmqpQueueClient::connect(&url, Duration::from_millis(200)),
        )
        .await
        .expect("connect must honour its timeout");

        assert!(matches!(result, Err(PipelineError::BrokerUnavailable(_))));
        accept.abort();
    }

    #[test]
    fn retry_count_round_trips_through_headers() {
        assert_eq!(retry_count(&properties(0)), 0);
        assert_eq!(retry_count(&properties(3)), 3);
    }

    #[test]
    fn missing_header_means_first_attempt() {
        assert_eq!(retry_count(&BasicProperties::default()), 0);
    }

    #[test]
    fn dead_letter_arguments_route_through_default_exchange() {
        let args = dead_letter_arguments("logs.dead-letter");
        let routing_key = args
            .inner()
            .iter()
            .find(|(k, _)| k.as_str() == "x-dead-letter-routing-key")
            .map(|(_, v)| v.clone());
        assert_eq!(
            routing_key,
            Some(AMQPValue::LongString("logs.dead-letter".to_string().into()))
        );
    }
}
