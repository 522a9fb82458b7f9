//! Change consumer with automatic reconnection.
//!
//! `ChangeConsumer` drains one durable subscription: it subscribes, hands each
//! delivery to a [`ChangeHandler`], settles the delivery according to the
//! result, resubscribes when the stream ends, and stops on shutdown.
//!
//! # Pattern: Subscribe-Process-Reconnect Loop
//!
//! ```text
//! loop {
//!     subscribe:
//!         loop {
//!             next delivery:
//!                 - handle under deadline, catching panics
//!                 - ack / requeue / reject
//!                 - check shutdown signal
//!         }
//!         if stream ended or subscribe failed:
//!             wait and retry
//! }
//! ```
//!
//! # Settlement rules
//!
//! | handler result                        | disposition                         |
//! |---------------------------------------|-------------------------------------|
//! | applied, skipped, ignored             | ack                                 |
//! | storage failure or deadline exceeded  | requeue, reject after the limit     |
//! | malformed payload or corrupt row      | reject                              |
//! | panic                                 | reject                              |

use super::handlers::{ChangeHandler, HandlerError};
use crate::metrics;
use futures::{FutureExt, StreamExt};
use quicket_core::change::ChangeMessage;
use quicket_core::change_bus::{ChangeBus, Delivery, DeliveryStream, Disposition, Subscription};
use quicket_runtime::panic_message;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Default per-message deadline.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default redelivery limit for transient failures.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 5;

/// Default delay before resubscribing.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Consumer of one subscription.
///
/// `ChangeConsumer` is `Send` so it can be moved into a tokio task via
/// [`ChangeConsumer::spawn`].
pub struct ChangeConsumer {
    name: String,
    subscription: Subscription,
    bus: Arc<dyn ChangeBus>,
    handler: Arc<dyn ChangeHandler>,
    shutdown: broadcast::Receiver<()>,
    handler_timeout: Duration,
    max_redeliveries: u32,
    retry_delay: Duration,
}

impl ChangeConsumer {
    /// Create a consumer with default timeouts.
    ///
    /// # Arguments
    ///
    /// * `name` - Consumer name for logs and metrics (e.g. "event-snapshots")
    /// * `subscription` - Queue to drain
    /// * `bus` - Change bus instance
    /// * `handler` - Handler applied to every delivery
    /// * `shutdown` - Broadcast receiver for graceful shutdown
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        subscription: Subscription,
        bus: Arc<dyn ChangeBus>,
        handler: Arc<dyn ChangeHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            subscription,
            bus,
            handler,
            shutdown,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Set the per-message deadline.
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set how many times a transient failure is redelivered before it is
    /// dead-lettered.
    #[must_use]
    pub const fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }

    /// Set the delay before resubscribing.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Consumer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the consumer as a background task.
    ///
    /// The task runs until a shutdown signal is received.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(
            consumer = %self.name,
            topic = %self.subscription.topic,
            group = %self.subscription.group,
            "Change consumer started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Change consumer received shutdown signal");
                    break;
                }
                subscribe_result = self.bus.subscribe(&self.subscription) => {
                    match subscribe_result {
                        Ok(mut stream) => {
                            info!(
                                consumer = %self.name,
                                topic = %self.subscription.topic,
                                "Subscribed to change bus"
                            );

                            if self.process_stream(&mut stream).await {
                                break;
                            }

                            warn!(
                                consumer = %self.name,
                                "Change stream ended, reconnecting in {:?}",
                                self.retry_delay
                            );
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to subscribe to change bus, retrying in {:?}",
                                self.retry_delay
                            );
                        }
                    }

                    tokio::select! {
                        _ = self.shutdown.recv() => break,
                        () = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }

        info!(consumer = %self.name, "Change consumer stopped");
    }

    /// Process deliveries until the stream ends or shutdown is signalled.
    ///
    /// Returns `true` on shutdown.
    async fn process_stream(&mut self, stream: &mut DeliveryStream) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Change consumer received shutdown signal during processing");
                    return true;
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => self.process(delivery).await,
                    Some(Err(e)) => {
                        error!(consumer = %self.name, error = %e, "Error receiving delivery");
                    }
                    None => return false,
                }
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let disposition = self.dispose(&delivery.message).await;
        let routing_key = delivery.message.routing_key.clone();
        let message_id = delivery.message.message_id.clone();

        if let Err(e) = delivery.settle(disposition).await {
            error!(
                consumer = %self.name,
                routing_key = %routing_key,
                message_id = %message_id,
                error = %e,
                "Failed to settle delivery"
            );
        }
    }

    /// Run the handler and decide what to do with the message.
    async fn dispose(&self, message: &ChangeMessage) -> Disposition {
        let run = AssertUnwindSafe(self.handler.handle(message)).catch_unwind();

        match tokio::time::timeout(self.handler_timeout, run).await {
            Ok(Ok(Ok(outcome))) => {
                metrics::record_snapshot_message(&self.name, outcome.as_str());
                Disposition::Ack
            }
            Ok(Ok(Err(e))) if e.is_transient() => self.redeliver_or_reject(message, &e.to_string()),
            Ok(Ok(Err(e))) => self.reject(message, &e),
            Ok(Err(panic)) => {
                let reason = format!("handler panicked: {}", panic_message(&*panic));
                error!(
                    consumer = %self.name,
                    routing_key = %message.routing_key,
                    message_id = %message.message_id,
                    panic = %reason,
                    "Handler panicked, dead-lettering message"
                );
                metrics::record_snapshot_message(&self.name, "dead_lettered");
                Disposition::Reject { reason }
            }
            Err(_) => self.redeliver_or_reject(message, "handler timed out"),
        }
    }

    fn redeliver_or_reject(&self, message: &ChangeMessage, reason: &str) -> Disposition {
        if message.redeliveries < self.max_redeliveries {
            warn!(
                consumer = %self.name,
                routing_key = %message.routing_key,
                message_id = %message.message_id,
                redeliveries = message.redeliveries,
                reason,
                "Transient failure, requeueing message"
            );
            metrics::record_snapshot_message(&self.name, "requeued");
            Disposition::Requeue
        } else {
            error!(
                consumer = %self.name,
                routing_key = %message.routing_key,
                message_id = %message.message_id,
                redeliveries = message.redeliveries,
                reason,
                "Redelivery limit reached, dead-lettering message"
            );
            metrics::record_snapshot_message(&self.name, "dead_lettered");
            Disposition::Reject {
                reason: format!("{reason} after {} redeliveries", message.redeliveries),
            }
        }
    }

    fn reject(&self, message: &ChangeMessage, e: &HandlerError) -> Disposition {
        error!(
            consumer = %self.name,
            routing_key = %message.routing_key,
            message_id = %message.message_id,
            error = %e,
            "Unprocessable message, dead-lettering"
        );
        metrics::record_snapshot_message(&self.name, "dead_lettered");
        Disposition::Reject {
            reason: e.to_string(),
        }
    }
}
