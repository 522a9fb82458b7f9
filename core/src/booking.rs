//! Bookings and their status machine.

use crate::types::{BookingId, EventId, Money, PublicId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Settlement status of a booking.
///
/// Bookings start `Pending`; a settlement moves them to `Success` or `Failed`
/// exactly once. Both are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    /// Awaiting settlement.
    Pending,
    /// Payment succeeded.
    Success,
    /// Payment failed.
    Failed,
}

impl BookingStatus {
    /// Storage / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether no further transition is allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Only `pending -> success` and `pending -> failed` are legal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Success | Self::Failed)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Storage-owned id.
    pub id: BookingId,
    /// Client-facing id.
    pub public_id: PublicId,
    /// Booked event.
    pub event_id: EventId,
    /// Booking user.
    pub user_id: UserId,
    /// Number of seats, always positive.
    pub seats: u32,
    /// Ticket price times seats.
    pub total: Money,
    /// Settlement status.
    pub status: BookingStatus,
    /// End of the payment hold.
    pub expires_at: DateTime<Utc>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// Input to the booking transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingRequest {
    /// Id to assign to the new booking.
    pub public_id: PublicId,
    /// Event to reserve against.
    pub event_id: EventId,
    /// Booking user.
    pub user_id: UserId,
    /// Seats requested.
    pub seats: u32,
    /// End of the payment hold.
    pub expires_at: DateTime<Utc>,
}

/// Result of a committed booking transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingReceipt {
    /// The inserted booking, status `pending`.
    pub booking: Booking,
    /// Seats left on the ledger row after the decrement.
    pub available_seats: u64,
    /// Ledger row version after the decrement.
    pub version: u64,
}
