//! Seat Ledger: the authoritative event record and the booking transaction.
//!
//! The ledger row is the only place available seats are decremented. A booking
//! is inserted and the seats are decremented in one transaction that holds a
//! no-wait row lock, so concurrent requests for the same event are serialized
//! and never oversell.

use crate::booking::{Booking, BookingReceipt, BookingRequest};
use crate::types::{EventId, Money, PublicId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No ledger row for the event.
    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    /// Not enough seats left.
    #[error("Seats unavailable: requested {requested}, available {available}")]
    SeatsUnavailable {
        /// Seats asked for.
        requested: u32,
        /// Seats left on the row.
        available: u64,
    },

    /// The row lock is held by another transaction.
    #[error("Event row is locked by a concurrent booking")]
    LockContention,

    /// A revision would leave fewer total seats than are already booked.
    #[error("Total seats {total} is below the {reserved} seats already booked")]
    CapacityBelowReserved {
        /// Requested total.
        total: u64,
        /// Seats already booked.
        reserved: u64,
    },

    /// The event still has bookings and cannot be removed.
    #[error("Event {0} has bookings")]
    EventInUse(EventId),

    /// Any other database failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockContention | Self::Storage(_))
    }
}

/// An event as held by the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Storage id.
    pub id: EventId,
    /// Client-facing id.
    pub public_id: PublicId,
    /// Title.
    pub title: String,
    /// Start of the event.
    pub start_date: DateTime<Utc>,
    /// End of the event; bookings close after it.
    pub end_date: DateTime<Utc>,
    /// Capacity.
    pub total_seats: u64,
    /// Seats not yet booked.
    pub available_seats: u64,
    /// Price of one seat.
    pub ticket_price: Money,
    /// Bumped on every change to the row.
    pub version: u64,
}

/// Fields for registering an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewEvent {
    /// Id to assign.
    pub public_id: PublicId,
    /// Title.
    pub title: String,
    /// Start.
    pub start_date: DateTime<Utc>,
    /// End.
    pub end_date: DateTime<Utc>,
    /// Capacity; all seats start available.
    pub total_seats: u64,
    /// Price of one seat.
    pub ticket_price: Money,
}

/// Replacement fields for an existing event.
///
/// Changing `total_seats` shifts `available_seats` by the same delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRevision {
    /// Title.
    pub title: String,
    /// Start.
    pub start_date: DateTime<Utc>,
    /// End.
    pub end_date: DateTime<Utc>,
    /// New capacity.
    pub total_seats: u64,
    /// Price of one seat.
    pub ticket_price: Money,
}

/// The booking transaction engine.
pub trait SeatLedger: Send + Sync {
    /// Reserve seats and insert a `pending` booking atomically.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::EventNotFound`] if the event row is missing
    /// - [`LedgerError::LockContention`] if the row lock is held elsewhere
    /// - [`LedgerError::SeatsUnavailable`] if fewer seats remain than requested
    /// - [`LedgerError::Storage`] for any other failure; nothing is committed
    fn create_booking(
        &self,
        request: BookingRequest,
    ) -> BoxFuture<'_, Result<BookingReceipt, LedgerError>>;

    /// Look a booking up by its public id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the read fails.
    fn find_booking(
        &self,
        public_id: PublicId,
    ) -> BoxFuture<'_, Result<Option<Booking>, LedgerError>>;
}

/// Owning-side writes to the ledger's event rows.
pub trait EventRegistry: Send + Sync {
    /// Insert a new event at version 1.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the insert fails.
    fn register_event(&self, event: NewEvent) -> BoxFuture<'_, Result<LedgerEvent, LedgerError>>;

    /// Replace an event's fields and bump its version.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::EventNotFound`] if the row is missing
    /// - [`LedgerError::CapacityBelowReserved`] if booked seats exceed the new total
    /// - [`LedgerError::LockContention`] if a booking holds the row
    fn revise_event(
        &self,
        id: EventId,
        revision: EventRevision,
    ) -> BoxFuture<'_, Result<LedgerEvent, LedgerError>>;

    /// Delete an event without bookings.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::EventNotFound`] if the row is missing
    /// - [`LedgerError::EventInUse`] if bookings reference it
    fn remove_event(&self, id: EventId) -> BoxFuture<'_, Result<LedgerEvent, LedgerError>>;

    /// Read an event row.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the read fails.
    fn find_event(&self, id: EventId) -> BoxFuture<'_, Result<Option<LedgerEvent>, LedgerError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(LedgerError::LockContention.is_transient());
        assert!(LedgerError::Storage("connection reset".into()).is_transient());
        assert!(!LedgerError::EventNotFound(EventId::new(1)).is_transient());
        assert!(
            !LedgerError::SeatsUnavailable {
                requested: 3,
                available: 2
            }
            .is_transient()
        );
    }
}
