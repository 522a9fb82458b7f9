//! Change handlers: apply decoded change messages to snapshot stores.
//!
//! The [`ChangeHandler`] trait is what makes [`super::ChangeConsumer`] generic.
//! Each handler decodes the routing key once into a tagged change and
//! dispatches with `match`:
//!
//! | routing key           | store call       |
//! |-----------------------|------------------|
//! | `*.created`           | `insert`         |
//! | `*.updated`           | `upsert`         |
//! | `event.seats.updated` | `update_seats`   |
//! | `*.deleted`           | `delete`         |
//!
//! Stale and duplicate messages are reported as [`HandleOutcome::Skipped`],
//! which the consumer acknowledges like any other success.

use async_trait::async_trait;
use quicket_core::change::{ChangeError, ChangeMessage, EventChange, UserChange};
use quicket_core::snapshot::{ApplyOutcome, EventSnapshotStore, SnapshotError, UserSnapshotStore};
use std::sync::Arc;
use thiserror::Error;

/// What a handler did with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The store changed.
    Applied,
    /// The message was stale, a duplicate, or targeted an absent row.
    Skipped,
    /// The routing key is not one this handler knows.
    Ignored,
}

impl HandleOutcome {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::Ignored => "ignored",
        }
    }
}

impl From<ApplyOutcome> for HandleOutcome {
    fn from(outcome: ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Applied => Self::Applied,
            ApplyOutcome::Skipped => Self::Skipped,
        }
    }
}

/// Errors raised while handling a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The body does not fit its routing key; redelivery cannot help.
    #[error(transparent)]
    Malformed(#[from] ChangeError),

    /// The store failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl HandlerError {
    /// Whether redelivering the message may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Snapshot(SnapshotError::Storage(_)))
    }
}

/// Processes one change message.
///
/// Implementors must be `Send + Sync + 'static` because handlers are shared
/// with the consumer task.
#[async_trait]
pub trait ChangeHandler: Send + Sync + 'static {
    /// Handle a message.
    ///
    /// # Errors
    ///
    /// - [`HandlerError::Malformed`] if the body cannot be decoded
    /// - [`HandlerError::Snapshot`] if the store fails
    async fn handle(&self, message: &ChangeMessage) -> Result<HandleOutcome, HandlerError>;
}

/// Applies event changes to the event snapshot store.
pub struct EventSnapshotHandler {
    store: Arc<dyn EventSnapshotStore>,
}

impl EventSnapshotHandler {
    /// Handler writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn EventSnapshotStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChangeHandler for EventSnapshotHandler {
    async fn handle(&self, message: &ChangeMessage) -> Result<HandleOutcome, HandlerError> {
        let Some(change) = EventChange::decode(message)? else {
            return Ok(HandleOutcome::Ignored);
        };

        let event_id = change.event_id();
        let outcome = match change {
            EventChange::Created(snapshot) => self.store.insert(snapshot).await?,
            EventChange::Updated(snapshot) => self.store.upsert(snapshot).await?,
            EventChange::SeatsUpdated(count) => {
                self.store
                    .update_seats(count.id, count.available_seats, count.version)
                    .await?
            }
            EventChange::Deleted(removed) => self.store.delete(removed.id).await?,
        };

        tracing::debug!(
            event_id = %event_id,
            routing_key = %message.routing_key,
            outcome = outcome.as_str(),
            "Event snapshot change handled"
        );
        Ok(outcome.into())
    }
}

/// Applies user changes to the user snapshot store.
pub struct UserSnapshotHandler {
    store: Arc<dyn UserSnapshotStore>,
}

impl UserSnapshotHandler {
    /// Handler writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn UserSnapshotStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChangeHandler for UserSnapshotHandler {
    async fn handle(&self, message: &ChangeMessage) -> Result<HandleOutcome, HandlerError> {
        let Some(change) = UserChange::decode(message)? else {
            return Ok(HandleOutcome::Ignored);
        };

        let user_id = change.user_id();
        let outcome = match change {
            UserChange::Created(snapshot) => self.store.insert(snapshot).await?,
            UserChange::Updated(snapshot) => self.store.upsert(snapshot).await?,
            UserChange::Deleted(removed) => self.store.delete(removed.id).await?,
        };

        tracing::debug!(
            user_id = %user_id,
            routing_key = %message.routing_key,
            outcome = outcome.as_str(),
            "User snapshot change handled"
        );
        Ok(outcome.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use quicket_core::change::{Removed, SeatCount, routing_keys};
    use quicket_core::snapshot::{EventSnapshot, UserSnapshot};
    use quicket_core::types::{EventId, Money, PublicId, UserId};
    use quicket_testing::{InMemoryEventSnapshots, InMemoryUserSnapshots};

    fn snapshot(version: u64, seats: u64) -> EventSnapshot {
        EventSnapshot {
            id: EventId::new(1),
            public_id: PublicId::new(),
            title: "RustConf".to_string(),
            start_date: Utc.with_ymd_and_hms(2030, 9, 1, 9, 0, 0).unwrap(),
            end_date: Utc.with_ymd_and_hms(2030, 9, 3, 18, 0, 0).unwrap(),
            available_seats: seats,
            ticket_price: Money::from_cents(4_900),
            version,
        }
    }

    fn seats(version: u64, available_seats: u64) -> ChangeMessage {
        EventChange::SeatsUpdated(SeatCount {
            id: EventId::new(1),
            public_id: PublicId::new(),
            available_seats,
            version,
        })
        .to_message()
        .unwrap()
    }

    fn event_handler() -> (InMemoryEventSnapshots, EventSnapshotHandler) {
        let store = InMemoryEventSnapshots::new();
        let handler = EventSnapshotHandler::new(Arc::new(store.clone()));
        (store, handler)
    }

    #[tokio::test]
    async fn test_stale_seat_update_keeps_newer_values() {
        let (store, handler) = event_handler();
        let created = EventChange::Created(snapshot(1, 100)).to_message().unwrap();
        handler.handle(&created).await.unwrap();

        assert_eq!(handler.handle(&seats(7, 40)).await.unwrap(), HandleOutcome::Applied);
        assert_eq!(handler.handle(&seats(5, 90)).await.unwrap(), HandleOutcome::Skipped);

        let stored = store.get(EventId::new(1)).unwrap();
        assert_eq!(stored.version, 7);
        assert_eq!(stored.available_seats, 40);
    }

    #[tokio::test]
    async fn test_same_version_twice_applies_once() {
        let (store, handler) = event_handler();
        let updated = EventChange::Updated(snapshot(3, 10)).to_message().unwrap();

        handler.handle(&updated).await.unwrap();
        let first = store.get(EventId::new(1));
        handler.handle(&updated).await.unwrap();

        assert_eq!(store.get(EventId::new(1)), first);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_created_after_update_is_skipped() {
        let (store, handler) = event_handler();
        handler
            .handle(&EventChange::Updated(snapshot(4, 10)).to_message().unwrap())
            .await
            .unwrap();

        let late_create = EventChange::Created(snapshot(1, 100)).to_message().unwrap();
        assert_eq!(handler.handle(&late_create).await.unwrap(), HandleOutcome::Skipped);
        assert_eq!(store.get(EventId::new(1)).unwrap().version, 4);
    }

    #[tokio::test]
    async fn test_seat_update_for_absent_event_is_skipped() {
        let (store, handler) = event_handler();
        assert_eq!(handler.handle(&seats(2, 5)).await.unwrap(), HandleOutcome::Skipped);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_unconditionally() {
        let (store, handler) = event_handler();
        handler
            .handle(&EventChange::Updated(snapshot(9, 10)).to_message().unwrap())
            .await
            .unwrap();

        let deleted = EventChange::Deleted(Removed {
            id: EventId::new(1),
            public_id: PublicId::new(),
            version: 1,
        })
        .to_message()
        .unwrap();

        assert_eq!(handler.handle(&deleted).await.unwrap(), HandleOutcome::Applied);
        assert!(store.is_empty());
        assert_eq!(handler.handle(&deleted).await.unwrap(), HandleOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_messages() {
        let (_store, handler) = event_handler();

        let unknown = ChangeMessage::new("event.archived", "1", b"{}".to_vec());
        assert_eq!(handler.handle(&unknown).await.unwrap(), HandleOutcome::Ignored);

        let malformed = ChangeMessage::new(routing_keys::EVENT_CREATED, "1", b"[]".to_vec());
        let err = handler.handle(&malformed).await.unwrap_err();
        assert!(matches!(err, HandlerError::Malformed(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_store_failure_is_transient() {
        let (store, handler) = event_handler();
        store.fail_next_writes(1);

        let err = handler.handle(&seats(1, 1)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_user_handler_lifecycle() {
        let store = InMemoryUserSnapshots::new();
        let handler = UserSnapshotHandler::new(Arc::new(store.clone()));
        let user = UserSnapshot {
            id: UserId::new(5),
            public_id: PublicId::new(),
            version: 1,
        };

        let created = UserChange::Created(user.clone()).to_message().unwrap();
        assert_eq!(handler.handle(&created).await.unwrap(), HandleOutcome::Applied);
        assert_eq!(store.get(UserId::new(5)), Some(user.clone()));

        let event_key = seats(1, 1);
        assert_eq!(handler.handle(&event_key).await.unwrap(), HandleOutcome::Ignored);

        let deleted = UserChange::Deleted(Removed {
            id: user.id,
            public_id: user.public_id,
            version: 2,
        })
        .to_message()
        .unwrap();
        handler.handle(&deleted).await.unwrap();
        assert_eq!(store.get(UserId::new(5)), None);
    }

    proptest! {
        #[test]
        fn seat_updates_converge_on_highest_version(
            updates in prop::collection::vec((1u64..50, 0u64..500), 1..20)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let (store, handler) = event_handler();
                handler
                    .handle(&EventChange::Created(snapshot(0, 0)).to_message().unwrap())
                    .await
                    .unwrap();

                for (version, available) in &updates {
                    handler.handle(&seats(*version, *available)).await.unwrap();
                }

                let max_version = updates.iter().map(|(v, _)| *v).max().unwrap();
                let stored = store.get(EventId::new(1)).unwrap();
                prop_assert_eq!(stored.version, max_version);
                let last_at_max = updates
                    .iter()
                    .rev()
                    .find(|(v, _)| *v == max_version)
                    .map(|(_, a)| *a)
                    .unwrap();
                prop_assert_eq!(stored.available_seats, last_at_max);
                Ok(())
            })?;
        }
    }
}
