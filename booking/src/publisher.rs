//! Change publisher.
//!
//! Encodes domain changes and publishes them to the per-domain topic. Every
//! publish happens after the change was committed; a failed publish leaves
//! downstream snapshots stale until the next change for the same entity.

use crate::error::PublishError;
use crate::metrics;
use quicket_core::change::{ChangeError, ChangeMessage, EventChange, SeatCount, UserChange};
use quicket_core::change_bus::ChangeBus;
use quicket_core::types::{EventId, PublicId};
use std::sync::Arc;

/// Publishes event and user changes.
#[derive(Clone)]
pub struct ChangePublisher {
    bus: Arc<dyn ChangeBus>,
    events_topic: String,
    users_topic: String,
}

impl ChangePublisher {
    /// Publisher writing to `events_topic` and `users_topic`.
    #[must_use]
    pub fn new(
        bus: Arc<dyn ChangeBus>,
        events_topic: impl Into<String>,
        users_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            events_topic: events_topic.into(),
            users_topic: users_topic.into(),
        }
    }

    /// Topic carrying event changes.
    #[must_use]
    pub fn events_topic(&self) -> &str {
        &self.events_topic
    }

    /// Topic carrying user changes.
    #[must_use]
    pub fn users_topic(&self) -> &str {
        &self.users_topic
    }

    /// Publish an event change.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if encoding or the bus fails.
    pub async fn publish_event_change(&self, change: &EventChange) -> Result<(), PublishError> {
        let routing_key = change.routing_key();
        let result = self.send(&self.events_topic, routing_key, change.to_message()).await;
        if result.is_ok() {
            tracing::debug!(
                event_id = %change.event_id(),
                routing_key,
                "Event change published"
            );
        }
        result
    }

    /// Publish a user change.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if encoding or the bus fails.
    pub async fn publish_user_change(&self, change: &UserChange) -> Result<(), PublishError> {
        let routing_key = change.routing_key();
        let result = self.send(&self.users_topic, routing_key, change.to_message()).await;
        if result.is_ok() {
            tracing::debug!(
                user_id = %change.user_id(),
                routing_key,
                "User change published"
            );
        }
        result
    }

    /// Publish `event.seats.updated` with the ledger's new count and version.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if encoding or the bus fails.
    pub async fn publish_seats_updated(
        &self,
        id: EventId,
        public_id: PublicId,
        available_seats: u64,
        version: u64,
    ) -> Result<(), PublishError> {
        self.publish_event_change(&EventChange::SeatsUpdated(SeatCount {
            id,
            public_id,
            available_seats,
            version,
        }))
        .await
    }

    async fn send(
        &self,
        topic: &str,
        routing_key: &'static str,
        message: Result<ChangeMessage, ChangeError>,
    ) -> Result<(), PublishError> {
        let outcome = match message {
            Ok(message) => self
                .bus
                .publish(topic, &message)
                .await
                .map_err(PublishError::from),
            Err(e) => Err(PublishError::from(e)),
        };

        match &outcome {
            Ok(()) => metrics::record_change_published(routing_key),
            Err(e) => {
                metrics::record_change_publish_failed(routing_key);
                tracing::warn!(topic, routing_key, error = %e, "Failed to publish change");
            }
        }
        outcome
    }
}
