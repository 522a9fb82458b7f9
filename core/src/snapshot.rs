//! Versioned local copies of upstream entities.
//!
//! A snapshot is written only by the change consumer. Every write is guarded
//! by the stored version so duplicate and out-of-order deliveries converge on
//! the newest state:
//!
//! | message          | absent           | present at `v`                 |
//! |------------------|------------------|--------------------------------|
//! | created `v'`     | insert           | skip                           |
//! | updated `v'`     | insert           | replace when `v' >= v`         |
//! | seats updated    | skip             | set seats when `v' >= v`       |
//! | deleted          | no-op            | remove                         |

use crate::ledger::LedgerEvent;
use crate::types::{EventId, Money, PublicId, UserId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by snapshot stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// A stored value cannot be represented (e.g. a negative seat count).
    #[error("Corrupt snapshot row: {0}")]
    Corrupt(String),

    /// Database failure; the message should be redelivered.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Whether a write changed the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The write took effect.
    Applied,
    /// The write was stale, duplicate or targeted an absent row.
    Skipped,
}

impl ApplyOutcome {
    /// Map an affected-rows count.
    #[must_use]
    pub const fn from_rows(rows: u64) -> Self {
        if rows > 0 { Self::Applied } else { Self::Skipped }
    }

    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Skipped => "skipped",
        }
    }
}

/// Local copy of an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSnapshot {
    /// Upstream id.
    pub id: EventId,
    /// Upstream public id.
    pub public_id: PublicId,
    /// Title.
    pub title: String,
    /// Start.
    pub start_date: DateTime<Utc>,
    /// End; bookings are refused after it.
    pub end_date: DateTime<Utc>,
    /// Seats available upstream as of `version`.
    pub available_seats: u64,
    /// Price of one seat.
    #[serde(default)]
    pub ticket_price: Money,
    /// Upstream version.
    pub version: u64,
}

impl From<&LedgerEvent> for EventSnapshot {
    fn from(event: &LedgerEvent) -> Self {
        Self {
            id: event.id,
            public_id: event.public_id,
            title: event.title.clone(),
            start_date: event.start_date,
            end_date: event.end_date,
            available_seats: event.available_seats,
            ticket_price: event.ticket_price,
            version: event.version,
        }
    }
}

/// Local copy of a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    /// Upstream id.
    pub id: UserId,
    /// Upstream public id.
    pub public_id: PublicId,
    /// Upstream version.
    #[serde(default = "first_version")]
    pub version: u64,
}

const fn first_version() -> u64 {
    1
}

/// Event snapshot store.
pub trait EventSnapshotStore: Send + Sync {
    /// Insert when absent.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Storage`] if the write fails.
    fn insert(&self, snapshot: EventSnapshot) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>>;

    /// Insert when absent, otherwise replace when the incoming version is not older.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Storage`] if the write fails.
    fn upsert(&self, snapshot: EventSnapshot) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>>;

    /// Set available seats when present and the incoming version is not older.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Storage`] if the write fails.
    fn update_seats(
        &self,
        id: EventId,
        available_seats: u64,
        version: u64,
    ) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>>;

    /// Remove unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Storage`] if the write fails.
    fn delete(&self, id: EventId) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>>;

    /// Read by public id.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the read fails or the row is corrupt.
    fn find_by_public_id(
        &self,
        public_id: PublicId,
    ) -> BoxFuture<'_, Result<Option<EventSnapshot>, SnapshotError>>;
}

/// User snapshot store.
pub trait UserSnapshotStore: Send + Sync {
    /// Insert when absent.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Storage`] if the write fails.
    fn insert(&self, snapshot: UserSnapshot) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>>;

    /// Insert when absent, otherwise replace when the incoming version is not older.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Storage`] if the write fails.
    fn upsert(&self, snapshot: UserSnapshot) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>>;

    /// Remove unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Storage`] if the write fails.
    fn delete(&self, id: UserId) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>>;

    /// Read by public id.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the read fails or the row is corrupt.
    fn find_by_public_id(
        &self,
        public_id: PublicId,
    ) -> BoxFuture<'_, Result<Option<UserSnapshot>, SnapshotError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_from_rows() {
        assert_eq!(ApplyOutcome::from_rows(0), ApplyOutcome::Skipped);
        assert_eq!(ApplyOutcome::from_rows(1), ApplyOutcome::Applied);
    }

    #[test]
    fn user_snapshot_version_defaults_to_one() {
        let json = format!(r#"{{"id":7,"public_id":"{}"}}"#, PublicId::new());
        let user: Result<UserSnapshot, _> = serde_json::from_str(&json);
        assert!(matches!(user, Ok(UserSnapshot { version: 1, .. })));
    }
}
