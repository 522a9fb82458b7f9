//! Owning-side event writes.
//!
//! The catalog changes the Seat Ledger's event rows and publishes the matching
//! change once the ledger has committed. A publish failure is logged and the
//! write still succeeds.

use crate::publisher::ChangePublisher;
use quicket_core::change::{EventChange, Removed};
use quicket_core::ledger::{EventRegistry, EventRevision, LedgerError, LedgerEvent, NewEvent};
use quicket_core::snapshot::EventSnapshot;
use quicket_core::types::EventId;
use std::sync::Arc;

/// Registers, revises and removes events.
#[derive(Clone)]
pub struct EventCatalog {
    registry: Arc<dyn EventRegistry>,
    publisher: ChangePublisher,
}

impl EventCatalog {
    /// Catalog over `registry`, announcing changes through `publisher`.
    #[must_use]
    pub fn new(registry: Arc<dyn EventRegistry>, publisher: ChangePublisher) -> Self {
        Self {
            registry,
            publisher,
        }
    }

    /// Register an event and publish `event.created`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the ledger insert fails.
    pub async fn register(&self, event: NewEvent) -> Result<LedgerEvent, LedgerError> {
        let created = self.registry.register_event(event).await?;
        tracing::info!(
            event_id = %created.id,
            public_id = %created.public_id,
            total_seats = created.total_seats,
            "Event registered"
        );
        self.announce(EventChange::Created(EventSnapshot::from(&created)))
            .await;
        Ok(created)
    }

    /// Revise an event and publish `event.updated`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::EventNotFound`] if the event is missing
    /// - [`LedgerError::CapacityBelowReserved`] if booked seats exceed the new total
    /// - [`LedgerError::LockContention`] if a booking holds the row
    pub async fn revise(
        &self,
        id: EventId,
        revision: EventRevision,
    ) -> Result<LedgerEvent, LedgerError> {
        let revised = self.registry.revise_event(id, revision).await?;
        tracing::info!(
            event_id = %revised.id,
            version = revised.version,
            available_seats = revised.available_seats,
            "Event revised"
        );
        self.announce(EventChange::Updated(EventSnapshot::from(&revised)))
            .await;
        Ok(revised)
    }

    /// Remove an event without bookings and publish `event.deleted`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::EventNotFound`] if the event is missing
    /// - [`LedgerError::EventInUse`] if bookings reference it
    pub async fn remove(&self, id: EventId) -> Result<LedgerEvent, LedgerError> {
        let removed = self.registry.remove_event(id).await?;
        tracing::info!(event_id = %removed.id, "Event removed");
        self.announce(EventChange::Deleted(Removed {
            id: removed.id,
            public_id: removed.public_id,
            version: removed.version,
        }))
        .await;
        Ok(removed)
    }

    /// Read an event row.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the read fails.
    pub async fn find(&self, id: EventId) -> Result<Option<LedgerEvent>, LedgerError> {
        self.registry.find_event(id).await
    }

    async fn announce(&self, change: EventChange) {
        if let Err(e) = self.publisher.publish_event_change(&change).await {
            tracing::error!(
                event_id = %change.event_id(),
                routing_key = change.routing_key(),
                error = %e,
                "Event change committed but not published"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use quicket_core::change::routing_keys;
    use quicket_core::types::Money;
    use quicket_testing::{InMemoryChangeBus, InMemoryLedger, fixtures};

    fn catalog(ledger: &InMemoryLedger, bus: &InMemoryChangeBus) -> EventCatalog {
        EventCatalog::new(
            Arc::new(ledger.clone()),
            ChangePublisher::new(Arc::new(bus.clone()), "events", "users"),
        )
    }

    fn revision(event: &LedgerEvent, total_seats: u64) -> EventRevision {
        EventRevision {
            title: format!("{} (rescheduled)", event.title),
            start_date: event.start_date,
            end_date: event.end_date,
            total_seats,
            ticket_price: Money::from_cents(3_000),
        }
    }

    #[tokio::test]
    async fn test_register_publishes_created_snapshot() {
        let ledger = InMemoryLedger::new();
        let bus = InMemoryChangeBus::new();

        let event = catalog(&ledger, &bus)
            .register(fixtures::new_event("RustConf", 50))
            .await
            .unwrap();

        let published = bus.published("events");
        assert_eq!(published.len(), 1);
        assert_eq!(
            EventChange::decode(&published[0]).unwrap(),
            Some(EventChange::Created(EventSnapshot::from(&event)))
        );
        assert_eq!(event.version, 1);
    }

    #[tokio::test]
    async fn test_revise_publishes_new_version() {
        let ledger = InMemoryLedger::new();
        let bus = InMemoryChangeBus::new();
        let catalog = catalog(&ledger, &bus);
        let event = catalog
            .register(fixtures::new_event("RustConf", 50))
            .await
            .unwrap();

        let revised = catalog.revise(event.id, revision(&event, 80)).await.unwrap();

        assert_eq!(revised.version, 2);
        assert_eq!(revised.available_seats, 80);
        let published = bus.published("events");
        assert_eq!(published[1].routing_key, routing_keys::EVENT_UPDATED);
    }

    #[tokio::test]
    async fn test_failed_revision_publishes_nothing() {
        let ledger = InMemoryLedger::new();
        let bus = InMemoryChangeBus::new();
        let catalog = catalog(&ledger, &bus);

        let result = catalog
            .revise(EventId::new(404), EventRevision {
                title: "Ghost".to_string(),
                start_date: chrono::Utc::now(),
                end_date: chrono::Utc::now(),
                total_seats: 1,
                ticket_price: Money::ZERO,
            })
            .await;

        assert_eq!(result, Err(LedgerError::EventNotFound(EventId::new(404))));
        assert!(bus.published("events").is_empty());
    }

    #[tokio::test]
    async fn test_remove_publishes_deleted() {
        let ledger = InMemoryLedger::new();
        let bus = InMemoryChangeBus::new();
        let catalog = catalog(&ledger, &bus);
        let event = catalog
            .register(fixtures::new_event("RustConf", 10))
            .await
            .unwrap();

        catalog.remove(event.id).await.unwrap();

        assert!(catalog.find(event.id).await.unwrap().is_none());
        let last = bus.published("events").pop().unwrap();
        assert_eq!(
            EventChange::decode(&last).unwrap(),
            Some(EventChange::Deleted(Removed {
                id: event.id,
                public_id: event.public_id,
                version: 1,
            }))
        );
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_fail_the_write() {
        let ledger = InMemoryLedger::new();
        let bus = InMemoryChangeBus::new();
        bus.fail_publishes(true);

        let event = catalog(&ledger, &bus)
            .register(fixtures::new_event("RustConf", 10))
            .await
            .unwrap();

        assert_eq!(ledger.available_seats(event.id), Some(10));
    }
}
