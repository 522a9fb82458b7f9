//! Seat ledger on `PostgreSQL`.

use crate::{from_db, is_foreign_key_violation, is_lock_not_available, to_db};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use quicket_core::booking::{Booking, BookingReceipt, BookingRequest, BookingStatus};
use quicket_core::ledger::{
    EventRegistry, EventRevision, LedgerError, LedgerEvent, NewEvent, SeatLedger,
};
use quicket_core::types::{BookingId, EventId, Money, PublicId, UserId};
use sqlx::PgPool;
use std::time::Instant;
use uuid::Uuid;

const BOOKING_COLUMNS: &str =
    "id, public_id, event_id, user_id, seats, total_cents, status, expires_at, created_at";
const EVENT_COLUMNS: &str = "id, public_id, title, start_date, end_date, total_seats, \
     available_seats, ticket_price_cents, version";

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: i64,
    public_id: Uuid,
    event_id: i64,
    user_id: i64,
    seats: i64,
    total_cents: i64,
    status: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = LedgerError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let status = BookingStatus::parse(&row.status)
            .ok_or_else(|| LedgerError::Storage(format!("Invalid booking status: {}", row.status)))?;
        let seats = u32::try_from(row.seats)
            .map_err(|_| LedgerError::Storage(format!("Invalid seat count: {}", row.seats)))?;
        Ok(Self {
            id: BookingId::new(row.id),
            public_id: PublicId::from_uuid(row.public_id),
            event_id: EventId::new(row.event_id),
            user_id: UserId::new(row.user_id),
            seats,
            total: Money::from_cents(row.total_cents),
            status,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    public_id: Uuid,
    title: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    total_seats: i64,
    available_seats: i64,
    ticket_price_cents: i64,
    version: i64,
}

impl TryFrom<EventRow> for LedgerEvent {
    type Error = LedgerError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let count = |value: i64, column: &str| {
            from_db(value).ok_or_else(|| LedgerError::Storage(format!("Invalid {column}: {value}")))
        };
        Ok(Self {
            id: EventId::new(row.id),
            public_id: PublicId::from_uuid(row.public_id),
            title: row.title,
            start_date: row.start_date,
            end_date: row.end_date,
            total_seats: count(row.total_seats, "total_seats")?,
            available_seats: count(row.available_seats, "available_seats")?,
            ticket_price: Money::from_cents(row.ticket_price_cents),
            version: count(row.version, "version")?,
        })
    }
}

fn storage(err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(err.to_string())
}

fn lock_or_storage(err: sqlx::Error) -> LedgerError {
    if is_lock_not_available(&err) {
        LedgerError::LockContention
    } else {
        storage(err)
    }
}

fn seats_to_db(seats: u64) -> Result<i64, LedgerError> {
    to_db(seats).ok_or_else(|| LedgerError::Storage(format!("Seat count out of range: {seats}")))
}

/// `PostgreSQL` implementation of [`SeatLedger`] and [`EventRegistry`].
#[derive(Clone, Debug)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Use an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn book(&self, request: BookingRequest) -> Result<BookingReceipt, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT available_seats, ticket_price_cents FROM events WHERE id = $1 FOR UPDATE NOWAIT",
        )
        .bind(request.event_id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(lock_or_storage)?;

        let Some((available, price_cents)) = row else {
            return Err(LedgerError::EventNotFound(request.event_id));
        };
        let available = from_db(available).unwrap_or(0);
        if available < u64::from(request.seats) {
            return Err(LedgerError::SeatsUnavailable {
                requested: request.seats,
                available,
            });
        }

        let total = Money::from_cents(price_cents).times(request.seats);
        let booking: BookingRow = sqlx::query_as(&format!(
            "INSERT INTO bookings (public_id, event_id, user_id, seats, total_cents, status, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(*request.public_id.as_uuid())
        .bind(request.event_id.get())
        .bind(request.user_id.get())
        .bind(i64::from(request.seats))
        .bind(total.cents())
        .bind(BookingStatus::Pending.as_str())
        .bind(request.expires_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        let (available_after, version): (i64, i64) = sqlx::query_as(
            "UPDATE events \
             SET available_seats = available_seats - $2, version = version + 1, updated_at = now() \
             WHERE id = $1 \
             RETURNING available_seats, version",
        )
        .bind(request.event_id.get())
        .bind(i64::from(request.seats))
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        let booking = Booking::try_from(booking)?;
        tx.commit().await.map_err(storage)?;

        Ok(BookingReceipt {
            booking,
            available_seats: from_db(available_after).unwrap_or(0),
            version: from_db(version).unwrap_or(0),
        })
    }

    async fn lock_event(
        tx: &mut sqlx::PgConnection,
        id: EventId,
    ) -> Result<LedgerEvent, LedgerError> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = $1 FOR UPDATE NOWAIT"
        ))
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(lock_or_storage)?;
        row.ok_or(LedgerError::EventNotFound(id))?.try_into()
    }
}

impl SeatLedger for PostgresLedger {
    fn create_booking(
        &self,
        request: BookingRequest,
    ) -> BoxFuture<'_, Result<BookingReceipt, LedgerError>> {
        Box::pin(async move {
            let event_id = request.event_id;
            let seats = request.seats;
            let started = Instant::now();
            let result = self.book(request).await;

            let outcome = match &result {
                Ok(_) => "committed",
                Err(LedgerError::LockContention) => "lock_contention",
                Err(LedgerError::SeatsUnavailable { .. }) => "seats_unavailable",
                Err(LedgerError::EventNotFound(_)) => "event_not_found",
                Err(_) => "error",
            };
            metrics::histogram!("quicket_ledger_transaction_duration_seconds", "outcome" => outcome)
                .record(started.elapsed().as_secs_f64());

            match &result {
                Ok(receipt) => tracing::debug!(
                    event_id = %event_id,
                    booking_id = %receipt.booking.id,
                    seats,
                    available_seats = receipt.available_seats,
                    version = receipt.version,
                    "Booking committed"
                ),
                Err(LedgerError::Storage(reason)) => {
                    tracing::error!(event_id = %event_id, seats, error = %reason, "Booking transaction failed");
                }
                Err(err) => tracing::debug!(event_id = %event_id, seats, error = %err, "Booking rejected"),
            }
            result
        })
    }

    fn find_booking(
        &self,
        public_id: PublicId,
    ) -> BoxFuture<'_, Result<Option<Booking>, LedgerError>> {
        Box::pin(async move {
            let row: Option<BookingRow> = sqlx::query_as(&format!(
                "SELECT {BOOKING_COLUMNS} FROM bookings WHERE public_id = $1"
            ))
            .bind(*public_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
            row.map(Booking::try_from).transpose()
        })
    }
}

impl EventRegistry for PostgresLedger {
    fn register_event(&self, event: NewEvent) -> BoxFuture<'_, Result<LedgerEvent, LedgerError>> {
        Box::pin(async move {
            let seats = seats_to_db(event.total_seats)?;
            let row: EventRow = sqlx::query_as(&format!(
                "INSERT INTO events \
                 (public_id, title, start_date, end_date, total_seats, available_seats, ticket_price_cents) \
                 VALUES ($1, $2, $3, $4, $5, $5, $6) RETURNING {EVENT_COLUMNS}"
            ))
            .bind(*event.public_id.as_uuid())
            .bind(&event.title)
            .bind(event.start_date)
            .bind(event.end_date)
            .bind(seats)
            .bind(event.ticket_price.cents())
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
            row.try_into()
        })
    }

    fn revise_event(
        &self,
        id: EventId,
        revision: EventRevision,
    ) -> BoxFuture<'_, Result<LedgerEvent, LedgerError>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(storage)?;
            let current = Self::lock_event(&mut tx, id).await?;

            let reserved = current.total_seats.saturating_sub(current.available_seats);
            if revision.total_seats < reserved {
                return Err(LedgerError::CapacityBelowReserved {
                    total: revision.total_seats,
                    reserved,
                });
            }

            let row: EventRow = sqlx::query_as(&format!(
                "UPDATE events \
                 SET title = $2, start_date = $3, end_date = $4, total_seats = $5, \
                     available_seats = $6, ticket_price_cents = $7, \
                     version = version + 1, updated_at = now() \
                 WHERE id = $1 RETURNING {EVENT_COLUMNS}"
            ))
            .bind(id.get())
            .bind(&revision.title)
            .bind(revision.start_date)
            .bind(revision.end_date)
            .bind(seats_to_db(revision.total_seats)?)
            .bind(seats_to_db(revision.total_seats - reserved)?)
            .bind(revision.ticket_price.cents())
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;

            tx.commit().await.map_err(storage)?;
            row.try_into()
        })
    }

    fn remove_event(&self, id: EventId) -> BoxFuture<'_, Result<LedgerEvent, LedgerError>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(storage)?;
            let current = Self::lock_event(&mut tx, id).await?;

            sqlx::query("DELETE FROM events WHERE id = $1")
                .bind(id.get())
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_foreign_key_violation(&e) {
                        LedgerError::EventInUse(id)
                    } else {
                        storage(e)
                    }
                })?;

            tx.commit().await.map_err(storage)?;
            Ok(current)
        })
    }

    fn find_event(&self, id: EventId) -> BoxFuture<'_, Result<Option<LedgerEvent>, LedgerError>> {
        Box::pin(async move {
            let row: Option<EventRow> =
                sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
                    .bind(id.get())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(storage)?;
            row.map(LedgerEvent::try_from).transpose()
        })
    }
}
