//! Change bus abstraction: publish change messages and consume them with
//! explicit acknowledgement.
//!
//! # Delivery contract
//!
//! ```text
//! publisher ──publish(topic, msg)──▶ topic ──▶ consumer group ──▶ Delivery
//!                                                                  │
//!                                   ┌──────────────┬───────────────┤
//!                                   ▼              ▼               ▼
//!                                  ack          requeue          reject
//!                               (committed)  (delivered again) (dead-letter topic)
//! ```
//!
//! - **At-least-once**: a delivery that is never settled is delivered again.
//! - **Bindings**: a subscription only sees messages whose routing key matches one
//!   of its [`RoutingPattern`]s; others are acknowledged by the bus.
//! - **Dead-letter**: rejected messages go to the subscription's dead-letter topic
//!   (or are dropped when none is configured).
//!
//! # Implementations
//!
//! - `InMemoryChangeBus` in `quicket-testing`
//! - `RedpandaChangeBus` in `quicket-redpanda`

use crate::change::{ChangeMessage, RoutingPattern};
use futures::Stream;
use futures::future::BoxFuture;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during change bus operations.
#[derive(Error, Debug, Clone)]
pub enum ChangeBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to settle (ack/requeue/reject) a delivery
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// What to do with a delivered message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Processed (or deliberately ignored); never deliver again.
    Ack,
    /// Deliver again later.
    Requeue,
    /// Move to the dead-letter topic.
    Reject {
        /// Why the message was rejected; attached to the dead letter.
        reason: String,
    },
}

impl Disposition {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue => "requeue",
            Self::Reject { .. } => "reject",
        }
    }
}

/// Settles one delivery. Implemented by each bus.
pub trait Acknowledger: Send {
    /// Apply the disposition.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeBusError::AckFailed`] if the broker could not record it.
    fn settle(self: Box<Self>, disposition: Disposition) -> BoxFuture<'static, Result<(), ChangeBusError>>;
}

/// A message handed to a subscriber, to be settled exactly once.
pub struct Delivery {
    /// The message.
    pub message: ChangeMessage,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Pair a message with the bus-specific acknowledger.
    #[must_use]
    pub fn new(message: ChangeMessage, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    /// Settle with `disposition`.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeBusError::AckFailed`] if the broker could not record it.
    pub async fn settle(self, disposition: Disposition) -> Result<(), ChangeBusError> {
        self.acker.settle(disposition).await
    }

    /// Acknowledge.
    ///
    /// # Errors
    ///
    /// See [`Delivery::settle`].
    pub async fn ack(self) -> Result<(), ChangeBusError> {
        self.settle(Disposition::Ack).await
    }

    /// Hand back for redelivery.
    ///
    /// # Errors
    ///
    /// See [`Delivery::settle`].
    pub async fn requeue(self) -> Result<(), ChangeBusError> {
        self.settle(Disposition::Requeue).await
    }

    /// Dead-letter.
    ///
    /// # Errors
    ///
    /// See [`Delivery::settle`].
    pub async fn reject(self, reason: impl Into<String>) -> Result<(), ChangeBusError> {
        self.settle(Disposition::Reject {
            reason: reason.into(),
        })
        .await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, ChangeBusError>> + Send>>;

/// A durable consumer queue bound to one topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    /// Topic to consume.
    pub topic: String,
    /// Durable queue / consumer group name.
    pub group: String,
    /// Routing key patterns this queue receives.
    pub bindings: Vec<RoutingPattern>,
    /// Where rejected messages go.
    pub dead_letter_topic: Option<String>,
}

impl Subscription {
    /// Subscribe `group` to every message on `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            bindings: Vec::new(),
            dead_letter_topic: None,
        }
    }

    /// Restrict to routing keys matching `pattern`.
    #[must_use]
    pub fn bind(mut self, pattern: impl Into<String>) -> Self {
        self.bindings.push(RoutingPattern::new(pattern));
        self
    }

    /// Set the dead-letter topic.
    #[must_use]
    pub fn dead_letter(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    /// Whether the queue receives `routing_key`. No bindings means everything.
    #[must_use]
    pub fn accepts(&self, routing_key: &str) -> bool {
        self.bindings.is_empty() || self.bindings.iter().any(|p| p.matches(routing_key))
    }
}

/// Trait for change bus implementations.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the bus can be shared as `Arc<dyn ChangeBus>`
/// between the publisher and every consumer task.
pub trait ChangeBus: Send + Sync {
    /// Publish a message to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeBusError::PublishFailed`] if the broker does not accept it.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a ChangeMessage,
    ) -> BoxFuture<'a, Result<(), ChangeBusError>>;

    /// Open a durable subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeBusError::SubscriptionFailed`] if the queue cannot be set up.
    fn subscribe<'a>(
        &'a self,
        subscription: &'a Subscription,
    ) -> BoxFuture<'a, Result<DeliveryStream, ChangeBusError>>;
}
