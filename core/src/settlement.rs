//! Payment records and the settlement store.

use crate::booking::BookingStatus;
use crate::types::{BookingId, Money, PaymentId, PublicId, UserId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of a settlement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Charged.
    Success,
    /// Declined.
    Failed,
}

impl PaymentStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Booking status this outcome settles to.
    #[must_use]
    pub const fn booking_status(self) -> BookingStatus {
        match self {
            Self::Success => BookingStatus::Success,
            Self::Failed => BookingStatus::Failed,
        }
    }
}

/// Payment to record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPayment {
    /// Id to assign.
    pub public_id: PublicId,
    /// Settled booking.
    pub booking_id: BookingId,
    /// Paying user.
    pub user_id: UserId,
    /// Amount charged or attempted.
    pub amount: Money,
    /// Outcome.
    pub status: PaymentStatus,
}

/// A recorded payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Storage id.
    pub id: PaymentId,
    /// Client-facing id.
    pub public_id: PublicId,
    /// Settled booking.
    pub booking_id: BookingId,
    /// Paying user.
    pub user_id: UserId,
    /// Amount.
    pub amount: Money,
    /// Outcome.
    pub status: PaymentStatus,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// Errors raised while recording a settlement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// No such booking.
    #[error("Booking not found: {0}")]
    BookingNotFound(BookingId),

    /// The booking already left `pending`.
    #[error("Booking {booking_id} already settled as {status}")]
    AlreadySettled {
        /// Booking.
        booking_id: BookingId,
        /// Its terminal status.
        status: BookingStatus,
    },

    /// The booking row is locked by another settlement.
    #[error("Booking row is locked")]
    LockContention,

    /// Any other database failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl SettlementError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockContention | Self::Storage(_))
    }
}

/// Persists payment outcomes.
pub trait SettlementStore: Send + Sync {
    /// In one transaction: lock the booking row without waiting, insert the
    /// payment, and move the booking to the outcome's status.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::BookingNotFound`] if the booking is missing
    /// - [`SettlementError::AlreadySettled`] if it is no longer `pending`
    /// - [`SettlementError::LockContention`] if the row is locked
    /// - [`SettlementError::Storage`] otherwise; nothing is committed
    fn record_settlement(
        &self,
        payment: NewPayment,
    ) -> BoxFuture<'_, Result<Payment, SettlementError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_maps_to_terminal_booking_status() {
        assert_eq!(PaymentStatus::Success.booking_status(), BookingStatus::Success);
        assert_eq!(PaymentStatus::Failed.booking_status(), BookingStatus::Failed);
        assert!(PaymentStatus::Failed.booking_status().is_terminal());
    }

    #[test]
    fn only_lock_and_storage_errors_are_transient() {
        assert!(SettlementError::LockContention.is_transient());
        assert!(
            !SettlementError::AlreadySettled {
                booking_id: BookingId::new(1),
                status: BookingStatus::Success,
            }
            .is_transient()
        );
    }
}
