//! In-memory change bus.
//!
//! Every publish is recorded. Each subscription gets its own unbounded queue;
//! requeued deliveries are pushed back onto it with `redeliveries + 1`, and
//! rejected ones are recorded as dead letters and published to the
//! subscription's dead-letter topic.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use futures::future::BoxFuture;
use quicket_core::change::ChangeMessage;
use quicket_core::change_bus::{
    Acknowledger, ChangeBus, ChangeBusError, Delivery, DeliveryStream, Disposition, Subscription,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// A settled delivery, for assertions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    /// Queue that received the message.
    pub group: String,
    /// The message as delivered.
    pub message: ChangeMessage,
    /// What the subscriber decided.
    pub disposition: Disposition,
}

/// A rejected message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    /// Queue that rejected it.
    pub group: String,
    /// The message.
    pub message: ChangeMessage,
    /// Rejection reason.
    pub reason: String,
}

struct Queue {
    subscription: Subscription,
    sender: mpsc::UnboundedSender<ChangeMessage>,
}

#[derive(Default)]
struct Inner {
    published: RwLock<Vec<(String, ChangeMessage)>>,
    queues: RwLock<Vec<Queue>>,
    settlements: RwLock<Vec<Settlement>>,
    dead_letters: RwLock<Vec<DeadLetter>>,
    fail_publish: AtomicBool,
}

impl Inner {
    fn route(&self, topic: &str, message: &ChangeMessage) {
        self.published
            .write()
            .unwrap()
            .push((topic.to_string(), message.clone()));

        for queue in self.queues.read().unwrap().iter() {
            if queue.subscription.topic == topic
                && queue.subscription.accepts(&message.routing_key)
            {
                let _ = queue.sender.send(message.clone());
            }
        }
    }
}

/// In-memory [`ChangeBus`]. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryChangeBus {
    inner: Arc<Inner>,
}

impl InMemoryChangeBus {
    /// Empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail until reset.
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Messages published to `topic`, in order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<ChangeMessage> {
        self.inner
            .published
            .read()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Every settled delivery, in order.
    #[must_use]
    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner.settlements.read().unwrap().clone()
    }

    /// Every rejected delivery, in order.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.read().unwrap().clone()
    }

    /// Open subscriptions on `topic`.
    #[must_use]
    pub fn subscriptions(&self, topic: &str) -> usize {
        self.inner
            .queues
            .read()
            .unwrap()
            .iter()
            .filter(|q| q.subscription.topic == topic)
            .count()
    }

    /// End every open subscription stream.
    pub fn close(&self) {
        self.inner.queues.write().unwrap().clear();
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    subscription: Subscription,
    message: ChangeMessage,
    requeue: mpsc::UnboundedSender<ChangeMessage>,
}

impl Acknowledger for InMemoryAcker {
    fn settle(self: Box<Self>, disposition: Disposition) -> BoxFuture<'static, Result<(), ChangeBusError>> {
        Box::pin(async move {
            let Self {
                inner,
                subscription,
                message,
                requeue,
            } = *self;

            inner.settlements.write().unwrap().push(Settlement {
                group: subscription.group.clone(),
                message: message.clone(),
                disposition: disposition.clone(),
            });

            match disposition {
                Disposition::Ack => {}
                Disposition::Requeue => {
                    requeue
                        .send(message.redelivered())
                        .map_err(|_| ChangeBusError::AckFailed("subscription closed".to_string()))?;
                }
                Disposition::Reject { reason } => {
                    inner.dead_letters.write().unwrap().push(DeadLetter {
                        group: subscription.group.clone(),
                        message: message.clone(),
                        reason,
                    });
                    if let Some(dlq) = &subscription.dead_letter_topic {
                        inner.route(dlq, &message);
                    }
                }
            }
            Ok(())
        })
    }
}

impl ChangeBus for InMemoryChangeBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a ChangeMessage,
    ) -> BoxFuture<'a, Result<(), ChangeBusError>> {
        Box::pin(async move {
            if self.inner.fail_publish.load(Ordering::SeqCst) {
                return Err(ChangeBusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "injected publish failure".to_string(),
                });
            }
            self.inner.route(topic, message);
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        subscription: &'a Subscription,
    ) -> BoxFuture<'a, Result<DeliveryStream, ChangeBusError>> {
        Box::pin(async move {
            let (sender, mut receiver) = mpsc::unbounded_channel();
            self.inner.queues.write().unwrap().push(Queue {
                subscription: subscription.clone(),
                sender: sender.clone(),
            });

            let inner = Arc::clone(&self.inner);
            let subscription = subscription.clone();
            let requeue = sender.downgrade();

            let stream = async_stream::stream! {
                while let Some(message) = receiver.recv().await {
                    let Some(requeue) = requeue.upgrade() else { break };
                    let acker = InMemoryAcker {
                        inner: Arc::clone(&inner),
                        subscription: subscription.clone(),
                        message: message.clone(),
                        requeue,
                    };
                    yield Ok::<_, ChangeBusError>(Delivery::new(message, Box::new(acker)));
                }
            };
            drop(sender);
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
