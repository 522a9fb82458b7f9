//! The booking use case.
//!
//! `create` resolves the event and user from their snapshots, refuses ended
//! events before touching the ledger, runs the booking transaction with retry
//! on transient errors, announces the new seat count, and hands the booking to
//! the settlement pool on a best-effort basis.

use crate::error::BookingError;
use crate::metrics;
use crate::publisher::ChangePublisher;
use crate::settlement::SettlementJob;
use chrono::{DateTime, Utc};
use quicket_core::booking::{Booking, BookingRequest, BookingStatus};
use quicket_core::environment::{Clock, IdGenerator, SystemClock, UuidGenerator};
use quicket_core::ledger::{EventRegistry, LedgerError, SeatLedger};
use quicket_core::snapshot::{EventSnapshot, EventSnapshotStore, UserSnapshotStore};
use quicket_core::types::{Money, PublicId};
use quicket_runtime::{RetryPolicy, SubmitError, WorkerPool, retry_with_predicate};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Default payment hold.
pub const DEFAULT_HOLD_MINUTES: i64 = 5;

/// A booking as shown to clients: public ids only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BookingView {
    /// Booking id.
    pub public_id: PublicId,
    /// Booked event.
    pub event_public_id: PublicId,
    /// Seats booked.
    pub seats: u32,
    /// Amount due.
    pub total: Money,
    /// Settlement status.
    pub status: BookingStatus,
    /// End of the payment hold.
    pub expires_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl BookingView {
    fn new(booking: &Booking, event_public_id: PublicId) -> Self {
        Self {
            public_id: booking.public_id,
            event_public_id,
            seats: booking.seats,
            total: booking.total,
            status: booking.status,
            expires_at: booking.expires_at,
            created_at: booking.created_at,
        }
    }
}

/// Booking service.
#[derive(Clone)]
pub struct BookingService {
    ledger: Arc<dyn SeatLedger>,
    registry: Arc<dyn EventRegistry>,
    events: Arc<dyn EventSnapshotStore>,
    users: Arc<dyn UserSnapshotStore>,
    publisher: ChangePublisher,
    settlement: Arc<WorkerPool<SettlementJob>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    hold: chrono::Duration,
    retry: RetryPolicy,
}

impl BookingService {
    /// Service with the wall clock, random ids, a five minute hold and the
    /// default retry policy.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn SeatLedger>,
        registry: Arc<dyn EventRegistry>,
        events: Arc<dyn EventSnapshotStore>,
        users: Arc<dyn UserSnapshotStore>,
        publisher: ChangePublisher,
        settlement: Arc<WorkerPool<SettlementJob>>,
    ) -> Self {
        Self {
            ledger,
            registry,
            events,
            users,
            publisher,
            settlement,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
            hold: chrono::Duration::minutes(DEFAULT_HOLD_MINUTES),
            retry: RetryPolicy::default(),
        }
    }

    /// Use `clock` for expiry checks and hold deadlines.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `ids` for booking and payment public ids.
    #[must_use]
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Set the payment hold.
    #[must_use]
    pub const fn with_hold(mut self, hold: chrono::Duration) -> Self {
        self.hold = hold;
        self
    }

    /// Set the retry policy for transient ledger errors.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Book `seats` seats of an event for a user.
    ///
    /// # Errors
    ///
    /// - [`BookingError::InvalidSeats`] if `seats` is zero
    /// - [`BookingError::EventNotFound`] if the event is unknown
    /// - [`BookingError::EventExpired`] if the event has ended; the ledger is not touched
    /// - [`BookingError::UserNotFound`] if the user is unknown
    /// - [`BookingError::SeatsUnavailable`] if too few seats are left
    /// - [`BookingError::Busy`] if the event row stayed locked through every retry
    /// - [`BookingError::Snapshot`] / [`BookingError::Ledger`] on storage failures
    pub async fn create(
        &self,
        event_public_id: PublicId,
        user_public_id: PublicId,
        seats: u32,
    ) -> Result<BookingView, BookingError> {
        let started = Instant::now();
        let result = self.try_create(event_public_id, user_public_id, seats).await;

        let outcome = match &result {
            Ok(_) => "created",
            Err(e) => {
                tracing::info!(
                    event = %event_public_id,
                    user = %user_public_id,
                    seats,
                    error = %e,
                    "Booking refused"
                );
                e.outcome()
            }
        };
        metrics::record_booking(outcome, seats, started.elapsed().as_secs_f64());
        result
    }

    async fn try_create(
        &self,
        event_public_id: PublicId,
        user_public_id: PublicId,
        seats: u32,
    ) -> Result<BookingView, BookingError> {
        if seats == 0 {
            return Err(BookingError::InvalidSeats);
        }

        let event = self
            .events
            .find_by_public_id(event_public_id)
            .await?
            .ok_or(BookingError::EventNotFound(event_public_id))?;

        let now = self.clock.now();
        if now > event.end_date {
            return Err(BookingError::EventExpired {
                event: event_public_id,
                ended_at: event.end_date,
            });
        }

        let user = self
            .users
            .find_by_public_id(user_public_id)
            .await?
            .ok_or(BookingError::UserNotFound(user_public_id))?;

        let request = BookingRequest {
            public_id: self.ids.public_id(),
            event_id: event.id,
            user_id: user.id,
            seats,
            expires_at: now + self.hold,
        };

        let receipt = retry_with_predicate(
            &self.retry,
            || self.ledger.create_booking(request.clone()),
            LedgerError::is_transient,
        )
        .await
        .map_err(|e| match e {
            LedgerError::EventNotFound(_) => BookingError::EventNotFound(event_public_id),
            LedgerError::SeatsUnavailable {
                requested,
                available,
            } => BookingError::SeatsUnavailable {
                requested,
                available,
            },
            LedgerError::LockContention => BookingError::Busy,
            other => BookingError::Ledger(other),
        })?;

        let booking = receipt.booking;
        tracing::info!(
            booking_id = %booking.id,
            public_id = %booking.public_id,
            event_id = %event.id,
            seats,
            available_seats = receipt.available_seats,
            version = receipt.version,
            "Booking created"
        );

        if let Err(e) = self
            .publisher
            .publish_seats_updated(
                event.id,
                event.public_id,
                receipt.available_seats,
                receipt.version,
            )
            .await
        {
            tracing::warn!(
                booking_id = %booking.id,
                event_id = %event.id,
                error = %e,
                "Booking committed but seat count not announced"
            );
        }

        self.submit_settlement(&booking);

        Ok(BookingView::new(&booking, event.public_id))
    }

    fn submit_settlement(&self, booking: &Booking) {
        let job = SettlementJob {
            booking_id: booking.id,
            user_id: booking.user_id,
            amount: booking.total,
            payment_public_id: self.ids.public_id(),
        };

        match self.settlement.submit(job) {
            Ok(()) => metrics::record_settlement("submitted"),
            Err(SubmitError::Busy(job)) => {
                metrics::record_settlement("rejected");
                tracing::warn!(
                    booking_id = %job.booking_id,
                    "Settlement queue full, booking stays pending"
                );
            }
            Err(SubmitError::Closed(job)) => {
                metrics::record_settlement("rejected");
                tracing::warn!(
                    booking_id = %job.booking_id,
                    "Settlement pool stopped, booking stays pending"
                );
            }
        }
    }

    /// Look a booking up by its public id.
    ///
    /// # Errors
    ///
    /// - [`BookingError::BookingNotFound`] if there is no such booking
    /// - [`BookingError::Ledger`] on storage failures
    pub async fn find(&self, public_id: PublicId) -> Result<BookingView, BookingError> {
        let booking = self
            .ledger
            .find_booking(public_id)
            .await
            .map_err(BookingError::Ledger)?
            .ok_or(BookingError::BookingNotFound(public_id))?;

        let event = self
            .registry
            .find_event(booking.event_id)
            .await
            .map_err(BookingError::Ledger)?
            .ok_or(BookingError::Ledger(LedgerError::EventNotFound(booking.event_id)))?;

        Ok(BookingView::new(&booking, event.public_id))
    }

    /// Read an event's snapshot.
    ///
    /// # Errors
    ///
    /// - [`BookingError::EventNotFound`] if there is no snapshot
    /// - [`BookingError::Snapshot`] on storage failures
    pub async fn event(&self, public_id: PublicId) -> Result<EventSnapshot, BookingError> {
        self.events
            .find_by_public_id(public_id)
            .await?
            .ok_or(BookingError::EventNotFound(public_id))
    }
}
