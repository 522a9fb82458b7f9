//! Booking service errors and their client-visible kinds.

use chrono::{DateTime, Utc};
use quicket_core::change::ChangeError;
use quicket_core::change_bus::ChangeBusError;
use quicket_core::ledger::LedgerError;
use quicket_core::snapshot::SnapshotError;
use quicket_core::types::PublicId;
use thiserror::Error;

/// What a client is told, independent of the failing component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The referenced event, user or booking does not exist.
    NotFound,
    /// The request is valid but cannot be honored (no seats left, event over).
    Conflict,
    /// Infrastructure failed or the row stayed locked; the request may succeed later.
    Unavailable,
    /// The request itself is wrong (seat count).
    Invalid,
}

/// Errors returned by [`crate::BookingService`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// Zero seats requested.
    #[error("Seat count must be positive")]
    InvalidSeats,

    /// No snapshot, or no ledger row, for the event.
    #[error("Event not found: {0}")]
    EventNotFound(PublicId),

    /// The event ended before the request.
    #[error("Event {event} ended at {ended_at}")]
    EventExpired {
        /// Event public id.
        event: PublicId,
        /// Its end date.
        ended_at: DateTime<Utc>,
    },

    /// No snapshot for the user.
    #[error("User not found: {0}")]
    UserNotFound(PublicId),

    /// Not enough seats left on the ledger.
    #[error("Requested {requested} seats but only {available} available")]
    SeatsUnavailable {
        /// Seats asked for.
        requested: u32,
        /// Seats left.
        available: u64,
    },

    /// No booking with that public id.
    #[error("Booking not found: {0}")]
    BookingNotFound(PublicId),

    /// The ledger row stayed locked through every retry.
    #[error("Event is busy, try again")]
    Busy,

    /// Snapshot read failed.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Ledger failed.
    #[error("Ledger error: {0}")]
    Ledger(LedgerError),
}

impl BookingError {
    /// Client-visible classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::EventNotFound(_) | Self::UserNotFound(_) | Self::BookingNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::SeatsUnavailable { .. } | Self::EventExpired { .. } => ErrorKind::Conflict,
            Self::InvalidSeats => ErrorKind::Invalid,
            Self::Busy | Self::Snapshot(_) | Self::Ledger(_) => ErrorKind::Unavailable,
        }
    }

    /// Label for the bookings counter.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::InvalidSeats => "invalid_seats",
            Self::EventNotFound(_) => "event_not_found",
            Self::EventExpired { .. } => "event_expired",
            Self::UserNotFound(_) => "user_not_found",
            Self::SeatsUnavailable { .. } => "seats_unavailable",
            Self::BookingNotFound(_) => "booking_not_found",
            Self::Busy => "lock_contention",
            Self::Snapshot(_) | Self::Ledger(_) => "error",
        }
    }
}

/// Errors publishing a change.
#[derive(Error, Debug, Clone)]
pub enum PublishError {
    /// The change could not be encoded.
    #[error(transparent)]
    Encode(#[from] ChangeError),

    /// The bus refused it.
    #[error(transparent)]
    Bus(#[from] ChangeBusError),
}

/// Errors wiring the service to its backends.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// The database pool could not be opened.
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migrations failed.
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The change bus could not be created.
    #[error("Change bus setup failed: {0}")]
    Bus(#[from] ChangeBusError),
}
