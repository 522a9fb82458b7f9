//! Redpanda change bus for Quicket.
//!
//! Implements [`ChangeBus`] on top of rdkafka, so it works against Redpanda or
//! any other Kafka-compatible broker.
//!
//! # Wire format
//!
//! | record part | content |
//! |-------------|---------|
//! | key | entity id (partitioning keeps one entity's changes in order) |
//! | payload | JSON body |
//! | header `routing_key` | change kind, e.g. `event.seats.updated` |
//! | header `message_id` | unique per publish, kept across redeliveries |
//! | header `redeliveries` | how many times the message was handed back |
//! | header `dead_letter_reason` | set on records in a dead-letter topic |
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits. Each subscription owns one
//! consumer task that hands out one [`Delivery`] at a time and waits for it to
//! be settled:
//!
//! - `ack`: commit the offset
//! - `requeue`: republish to the same topic with `redeliveries + 1`, then commit
//! - `reject`: publish to the dead-letter topic with the reason, then commit
//!
//! Records whose routing key is not bound by the subscription are committed
//! without being handed out. If a delivery is dropped unsettled, or settling
//! fails, the task stops without committing and the stream ends; a new
//! subscription resumes from the last committed offset.
//!
//! # Example
//!
//! ```no_run
//! use quicket_core::change_bus::{ChangeBus, Subscription};
//! use quicket_redpanda::RedpandaChangeBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaChangeBus::new("localhost:9092")?;
//!
//! let subscription = Subscription::new("events", "booking-events")
//!     .bind("event.#")
//!     .dead_letter("events.dlq");
//! let mut deliveries = bus.subscribe(&subscription).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("{}", delivery.message.routing_key);
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

use futures::future::BoxFuture;
use quicket_core::change::ChangeMessage;
use quicket_core::change_bus::{
    Acknowledger, ChangeBus, ChangeBusError, Delivery, DeliveryStream, Disposition, Subscription,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Header carrying the routing key.
pub const ROUTING_KEY_HEADER: &str = "routing_key";
/// Header carrying the message id.
pub const MESSAGE_ID_HEADER: &str = "message_id";
/// Header carrying the redelivery count.
pub const REDELIVERIES_HEADER: &str = "redeliveries";
/// Header carrying the rejection reason on dead letters.
pub const DEAD_LETTER_REASON_HEADER: &str = "dead_letter_reason";

/// Redpanda change bus.
///
/// Cheap to share behind an `Arc<dyn ChangeBus>`: the producer is reused by
/// every publish and by each subscription's requeue and dead-letter path.
///
/// ```no_run
/// use quicket_redpanda::RedpandaChangeBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaChangeBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaChangeBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    auto_offset_reset: String,
}

impl RedpandaChangeBus {
    /// Create a bus with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, ChangeBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring a bus.
    #[must_use]
    pub fn builder() -> RedpandaChangeBusBuilder {
        RedpandaChangeBusBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for [`RedpandaChangeBus`].
#[derive(Default)]
pub struct RedpandaChangeBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
}

impl RedpandaChangeBusBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Where a consumer group with no committed offset starts reading.
    ///
    /// Default: `"earliest"`, so a new snapshot consumer sees the full history
    /// still retained by the topic.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the bus.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeBusError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaChangeBus, ChangeBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| ChangeBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| ChangeBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let auto_offset_reset = self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string());
        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaChangeBus created"
        );

        Ok(RedpandaChangeBus {
            producer,
            brokers,
            timeout,
            auto_offset_reset,
        })
    }
}

/// Record headers for `message`, plus the rejection reason on dead letters.
fn encode_headers(message: &ChangeMessage, dead_letter_reason: Option<&str>) -> OwnedHeaders {
    let redeliveries = message.redeliveries.to_string();
    let headers = OwnedHeaders::new_with_capacity(4)
        .insert(Header {
            key: ROUTING_KEY_HEADER,
            value: Some(message.routing_key.as_str()),
        })
        .insert(Header {
            key: MESSAGE_ID_HEADER,
            value: Some(message.message_id.as_str()),
        })
        .insert(Header {
            key: REDELIVERIES_HEADER,
            value: Some(redeliveries.as_str()),
        });
    match dead_letter_reason {
        Some(reason) => headers.insert(Header {
            key: DEAD_LETTER_REASON_HEADER,
            value: Some(reason),
        }),
        None => headers,
    }
}

/// Rebuild a [`ChangeMessage`] from a consumed record.
///
/// A missing `routing_key` header yields an empty routing key; a missing
/// `message_id` yields a fresh one.
fn decode_message<H: Headers>(
    key: Option<&[u8]>,
    payload: Option<&[u8]>,
    headers: Option<&H>,
) -> ChangeMessage {
    let mut message = ChangeMessage::new(
        String::new(),
        key.map(|k| String::from_utf8_lossy(k).into_owned()).unwrap_or_default(),
        payload.map(<[u8]>::to_vec).unwrap_or_default(),
    );
    let Some(headers) = headers else {
        return message;
    };
    for header in headers.iter() {
        let Some(value) = header.value.and_then(|v| std::str::from_utf8(v).ok()) else {
            continue;
        };
        match header.key {
            ROUTING_KEY_HEADER => message.routing_key = value.to_string(),
            MESSAGE_ID_HEADER => message.message_id = value.to_string(),
            REDELIVERIES_HEADER => message.redeliveries = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    message
}

async fn produce(
    producer: &FutureProducer,
    timeout: Duration,
    topic: &str,
    message: &ChangeMessage,
    dead_letter_reason: Option<&str>,
) -> Result<(), ChangeBusError> {
    let record = FutureRecord::to(topic)
        .key(message.key.as_str())
        .payload(message.body.as_slice())
        .headers(encode_headers(message, dead_letter_reason));

    match producer.send(record, Timeout::After(timeout)).await {
        Ok((partition, offset)) => {
            tracing::debug!(
                topic,
                partition,
                offset,
                routing_key = %message.routing_key,
                message_id = %message.message_id,
                "Change message published"
            );
            Ok(())
        }
        Err((kafka_error, _)) => {
            tracing::error!(
                topic,
                routing_key = %message.routing_key,
                error = %kafka_error,
                "Failed to publish change message"
            );
            Err(ChangeBusError::PublishFailed {
                topic: topic.to_string(),
                reason: kafka_error.to_string(),
            })
        }
    }
}

/// A subscriber's verdict, sent back to the consumer task.
struct Verdict {
    disposition: Disposition,
    reply: oneshot::Sender<Result<(), ChangeBusError>>,
}

struct RedpandaAcker {
    verdict: oneshot::Sender<Verdict>,
}

impl Acknowledger for RedpandaAcker {
    fn settle(self: Box<Self>, disposition: Disposition) -> BoxFuture<'static, Result<(), ChangeBusError>> {
        let verdict = self.verdict;
        Box::pin(async move {
            let (reply, outcome) = oneshot::channel();
            verdict
                .send(Verdict { disposition, reply })
                .map_err(|_| ChangeBusError::AckFailed("Subscription closed".to_string()))?;
            outcome
                .await
                .map_err(|_| ChangeBusError::AckFailed("Subscription closed before settling".to_string()))?
        })
    }
}

/// Everything a subscription task needs to act on dispositions.
struct SettleContext {
    producer: FutureProducer,
    timeout: Duration,
    subscription: Subscription,
}

impl SettleContext {
    /// Carry out the broker side of a disposition. The caller commits.
    async fn apply(&self, message: ChangeMessage, disposition: &Disposition) -> Result<(), ChangeBusError> {
        match disposition {
            Disposition::Ack => Ok(()),
            Disposition::Requeue => {
                let message = message.redelivered();
                produce(&self.producer, self.timeout, &self.subscription.topic, &message, None).await
            }
            Disposition::Reject { reason } => self.dead_letter(&message, reason).await,
        }
    }

    async fn dead_letter(&self, message: &ChangeMessage, reason: &str) -> Result<(), ChangeBusError> {
        tracing::warn!(
            topic = %self.subscription.topic,
            group = %self.subscription.group,
            routing_key = %message.routing_key,
            message_id = %message.message_id,
            reason,
            "Dead-lettering change message"
        );
        match &self.subscription.dead_letter_topic {
            Some(topic) => produce(&self.producer, self.timeout, topic, message, Some(reason)).await,
            None => Ok(()),
        }
    }
}

fn commit(consumer: &StreamConsumer, message: &BorrowedMessage<'_>) -> Result<(), ChangeBusError> {
    consumer
        .commit_message(message, CommitMode::Async)
        .map_err(|e| ChangeBusError::AckFailed(format!("Failed to commit offset: {e}")))
}

/// Drive one subscription until the receiver goes away or settling fails.
async fn run_subscription(
    consumer: StreamConsumer,
    context: SettleContext,
    deliveries: mpsc::Sender<Result<Delivery, ChangeBusError>>,
) {
    use futures::StreamExt;

    let mut stream = consumer.stream();

    while let Some(next) = stream.next().await {
        let record = match next {
            Ok(record) => record,
            Err(e) => {
                let err = ChangeBusError::TransportError(format!("Failed to receive message: {e}"));
                if deliveries.send(Err(err)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let message = decode_message(record.key(), record.payload(), record.headers());

        let settled = if message.routing_key.is_empty() {
            context.dead_letter(&message, "Missing routing_key header").await
        } else if !context.subscription.accepts(&message.routing_key) {
            tracing::trace!(routing_key = %message.routing_key, "Skipping unbound routing key");
            Ok(())
        } else {
            let (verdict_tx, verdict_rx) = oneshot::channel();
            let delivery = Delivery::new(
                message.clone(),
                Box::new(RedpandaAcker {
                    verdict: verdict_tx,
                }),
            );
            if deliveries.send(Ok(delivery)).await.is_err() {
                tracing::debug!("Delivery receiver dropped, exiting consumer task");
                break;
            }
            let Ok(Verdict { disposition, reply }) = verdict_rx.await else {
                tracing::warn!(
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    "Delivery dropped without settlement; closing subscription"
                );
                break;
            };
            let result = match context.apply(message, &disposition).await {
                Ok(()) => commit(&consumer, &record),
                Err(e) => Err(e),
            };
            let failed = result.is_err();
            let _ = reply.send(result);
            if failed {
                break;
            }
            continue;
        };

        if let Err(e) = settled.and_then(|()| commit(&consumer, &record)) {
            tracing::warn!(
                topic = record.topic(),
                partition = record.partition(),
                offset = record.offset(),
                error = %e,
                "Failed to settle record; closing subscription"
            );
            break;
        }
    }

    tracing::debug!(group = %context.subscription.group, "Consumer task exiting");
}

impl ChangeBus for RedpandaChangeBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a ChangeMessage,
    ) -> BoxFuture<'a, Result<(), ChangeBusError>> {
        Box::pin(produce(&self.producer, self.timeout, topic, message, None))
    }

    fn subscribe<'a>(
        &'a self,
        subscription: &'a Subscription,
    ) -> BoxFuture<'a, Result<DeliveryStream, ChangeBusError>> {
        Box::pin(async move {
            let subscription_failed = |reason: String| ChangeBusError::SubscriptionFailed {
                topic: subscription.topic.clone(),
                reason,
            };

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &subscription.group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

            consumer
                .subscribe(&[subscription.topic.as_str()])
                .map_err(|e| subscription_failed(format!("Failed to subscribe: {e}")))?;

            tracing::info!(
                topic = %subscription.topic,
                group = %subscription.group,
                bindings = ?subscription.bindings.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
                dead_letter_topic = ?subscription.dead_letter_topic,
                "Subscribed"
            );

            let (tx, rx) = mpsc::channel(1);
            let context = SettleContext {
                producer: self.producer.clone(),
                timeout: self.timeout,
                subscription: subscription.clone(),
            };
            tokio::spawn(run_subscription(consumer, context, tx));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use rdkafka::message::BorrowedHeaders;

    #[test]
    fn redpanda_change_bus_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RedpandaChangeBus>();
    }

    #[test]
    fn build_requires_brokers() {
        let result = RedpandaChangeBus::builder().build();
        assert!(matches!(result, Err(ChangeBusError::ConnectionFailed(_))));
    }

    #[test]
    fn headers_carry_routing_metadata() {
        let message = ChangeMessage::new("event.seats.updated", "42", br#"{"id":42}"#.to_vec())
            .redelivered()
            .redelivered();

        let headers = encode_headers(&message, None);
        let decoded = decode_message(
            Some(message.key.as_bytes()),
            Some(message.body.as_slice()),
            Some(&headers),
        );

        assert_eq!(decoded, message);
    }

    #[test]
    fn dead_letter_headers_include_reason() {
        let message = ChangeMessage::new("event.created", "1", Vec::new());
        let headers = encode_headers(&message, Some("Malformed payload"));

        let reason = headers
            .iter()
            .find(|h| h.key == DEAD_LETTER_REASON_HEADER)
            .and_then(|h| h.value)
            .map(|v| String::from_utf8_lossy(v).into_owned());
        assert_eq!(reason.as_deref(), Some("Malformed payload"));
    }

    #[test]
    fn record_without_headers_has_no_routing_key() {
        let decoded = decode_message::<BorrowedHeaders>(Some(b"7"), Some(b"{}"), None);

        assert!(decoded.routing_key.is_empty());
        assert_eq!(decoded.key, "7");
        assert_eq!(decoded.redeliveries, 0);
        assert!(!decoded.message_id.is_empty());
    }
}
