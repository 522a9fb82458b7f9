//! In-memory seat ledger with real no-wait row locks.
//!
//! Each event row and each booking row sits behind its own `tokio::sync::Mutex`.
//! Transactions take the row with `try_lock`, so a concurrent holder produces
//! `LockContention` exactly like `FOR UPDATE NOWAIT`. All checks run before any
//! mutation, so a failed transaction leaves nothing behind.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::Utc;
use futures::future::BoxFuture;
use quicket_core::booking::{Booking, BookingReceipt, BookingRequest, BookingStatus};
use quicket_core::ledger::{
    EventRegistry, EventRevision, LedgerError, LedgerEvent, NewEvent, SeatLedger,
};
use quicket_core::settlement::{NewPayment, Payment, SettlementError, SettlementStore};
use quicket_core::types::{BookingId, EventId, PaymentId, PublicId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    events: HashMap<EventId, Arc<Mutex<LedgerEvent>>>,
    bookings: HashMap<BookingId, Arc<Mutex<Booking>>>,
    payments: Vec<Payment>,
    next_event: i64,
    next_booking: i64,
    next_payment: i64,
}

/// In-memory [`SeatLedger`], [`EventRegistry`] and [`SettlementStore`].
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<RwLock<State>>,
    hold: Arc<RwLock<Option<Duration>>>,
    fail_next_insert: Arc<AtomicBool>,
}

impl InMemoryLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the event row locked for `hold` inside every booking transaction,
    /// widening the window for contention.
    pub fn set_hold(&self, hold: Duration) {
        *self.hold.write().unwrap() = Some(hold);
    }

    /// Make the next booking insert fail after the row was locked and checked.
    pub fn fail_next_insert(&self) {
        self.fail_next_insert.store(true, Ordering::SeqCst);
    }

    /// Insert an event synchronously at version 1.
    pub fn seed_event(&self, event: NewEvent) -> LedgerEvent {
        let mut state = self.state.write().unwrap();
        state.next_event += 1;
        let row = LedgerEvent {
            id: EventId::new(state.next_event),
            public_id: event.public_id,
            title: event.title,
            start_date: event.start_date,
            end_date: event.end_date,
            total_seats: event.total_seats,
            available_seats: event.total_seats,
            ticket_price: event.ticket_price,
            version: 1,
        };
        state
            .events
            .insert(row.id, Arc::new(Mutex::new(row.clone())));
        row
    }

    /// Current seat count, if the row exists and is not locked.
    #[must_use]
    pub fn available_seats(&self, id: EventId) -> Option<u64> {
        self.event(id).map(|e| e.available_seats)
    }

    /// Current row, if it exists and is not locked.
    #[must_use]
    pub fn event(&self, id: EventId) -> Option<LedgerEvent> {
        let row = self.state.read().unwrap().events.get(&id).cloned()?;
        let guard = row.try_lock().ok()?;
        Some(guard.clone())
    }

    /// Every booking, ordered by id.
    #[must_use]
    pub fn bookings(&self) -> Vec<Booking> {
        let rows: Vec<_> = self.state.read().unwrap().bookings.values().cloned().collect();
        let mut bookings: Vec<Booking> = rows
            .iter()
            .filter_map(|row| row.try_lock().ok().map(|b| b.clone()))
            .collect();
        bookings.sort_by_key(|b| b.id);
        bookings
    }

    /// Every recorded payment.
    #[must_use]
    pub fn payments(&self) -> Vec<Payment> {
        self.state.read().unwrap().payments.clone()
    }

    /// Hold a booking row locked, as a concurrent settlement would.
    pub async fn lock_booking(&self, id: BookingId) -> Option<tokio::sync::OwnedMutexGuard<Booking>> {
        let row = self.state.read().unwrap().bookings.get(&id).cloned()?;
        Some(row.lock_owned().await)
    }

    /// Hold an event row locked, as a concurrent booking would.
    pub async fn lock_event(
        &self,
        id: EventId,
    ) -> Option<tokio::sync::OwnedMutexGuard<LedgerEvent>> {
        let row = self.state.read().unwrap().events.get(&id).cloned()?;
        Some(row.lock_owned().await)
    }

    fn event_row(&self, id: EventId) -> Option<Arc<Mutex<LedgerEvent>>> {
        self.state.read().unwrap().events.get(&id).cloned()
    }

    fn booking_row(&self, id: BookingId) -> Option<Arc<Mutex<Booking>>> {
        self.state.read().unwrap().bookings.get(&id).cloned()
    }
}

impl SeatLedger for InMemoryLedger {
    fn create_booking(
        &self,
        request: BookingRequest,
    ) -> BoxFuture<'_, Result<BookingReceipt, LedgerError>> {
        Box::pin(async move {
            let row = self
                .event_row(request.event_id)
                .ok_or(LedgerError::EventNotFound(request.event_id))?;
            let mut event = row.try_lock().map_err(|_| LedgerError::LockContention)?;

            if event.available_seats < u64::from(request.seats) {
                return Err(LedgerError::SeatsUnavailable {
                    requested: request.seats,
                    available: event.available_seats,
                });
            }

            let hold = *self.hold.read().unwrap();
            if let Some(hold) = hold {
                tokio::time::sleep(hold).await;
            }

            if self.fail_next_insert.swap(false, Ordering::SeqCst) {
                return Err(LedgerError::Storage("injected insert failure".to_string()));
            }

            let booking = {
                let mut state = self.state.write().unwrap();
                state.next_booking += 1;
                let booking = Booking {
                    id: BookingId::new(state.next_booking),
                    public_id: request.public_id,
                    event_id: request.event_id,
                    user_id: request.user_id,
                    seats: request.seats,
                    total: event.ticket_price.times(request.seats),
                    status: BookingStatus::Pending,
                    expires_at: request.expires_at,
                    created_at: Utc::now(),
                };
                state
                    .bookings
                    .insert(booking.id, Arc::new(Mutex::new(booking.clone())));
                booking
            };

            event.available_seats -= u64::from(request.seats);
            event.version += 1;

            Ok(BookingReceipt {
                booking,
                available_seats: event.available_seats,
                version: event.version,
            })
        })
    }

    fn find_booking(
        &self,
        public_id: PublicId,
    ) -> BoxFuture<'_, Result<Option<Booking>, LedgerError>> {
        Box::pin(async move {
            let rows: Vec<_> = self.state.read().unwrap().bookings.values().cloned().collect();
            for row in rows {
                let booking = row.lock().await;
                if booking.public_id == public_id {
                    return Ok(Some(booking.clone()));
                }
            }
            Ok(None)
        })
    }
}

impl EventRegistry for InMemoryLedger {
    fn register_event(&self, event: NewEvent) -> BoxFuture<'_, Result<LedgerEvent, LedgerError>> {
        Box::pin(async move { Ok(self.seed_event(event)) })
    }

    fn revise_event(
        &self,
        id: EventId,
        revision: EventRevision,
    ) -> BoxFuture<'_, Result<LedgerEvent, LedgerError>> {
        Box::pin(async move {
            let row = self.event_row(id).ok_or(LedgerError::EventNotFound(id))?;
            let mut event = row.try_lock().map_err(|_| LedgerError::LockContention)?;

            let reserved = event.total_seats - event.available_seats;
            if revision.total_seats < reserved {
                return Err(LedgerError::CapacityBelowReserved {
                    total: revision.total_seats,
                    reserved,
                });
            }

            event.title = revision.title;
            event.start_date = revision.start_date;
            event.end_date = revision.end_date;
            event.available_seats = revision.total_seats - reserved;
            event.total_seats = revision.total_seats;
            event.ticket_price = revision.ticket_price;
            event.version += 1;
            Ok(event.clone())
        })
    }

    fn remove_event(&self, id: EventId) -> BoxFuture<'_, Result<LedgerEvent, LedgerError>> {
        Box::pin(async move {
            let row = self.event_row(id).ok_or(LedgerError::EventNotFound(id))?;
            let event = row.try_lock().map_err(|_| LedgerError::LockContention)?;

            let booking_rows: Vec<_> =
                self.state.read().unwrap().bookings.values().cloned().collect();
            for booking in booking_rows {
                if booking.lock().await.event_id == id {
                    return Err(LedgerError::EventInUse(id));
                }
            }

            self.state.write().unwrap().events.remove(&id);
            Ok(event.clone())
        })
    }

    fn find_event(&self, id: EventId) -> BoxFuture<'_, Result<Option<LedgerEvent>, LedgerError>> {
        Box::pin(async move {
            match self.event_row(id) {
                Some(row) => Ok(Some(row.lock().await.clone())),
                None => Ok(None),
            }
        })
    }
}

impl SettlementStore for InMemoryLedger {
    fn record_settlement(
        &self,
        payment: NewPayment,
    ) -> BoxFuture<'_, Result<Payment, SettlementError>> {
        Box::pin(async move {
            let row = self
                .booking_row(payment.booking_id)
                .ok_or(SettlementError::BookingNotFound(payment.booking_id))?;
            let mut booking = row.try_lock().map_err(|_| SettlementError::LockContention)?;

            let next = payment.status.booking_status();
            if !booking.status.can_transition_to(next) {
                return Err(SettlementError::AlreadySettled {
                    booking_id: booking.id,
                    status: booking.status,
                });
            }

            let mut state = self.state.write().unwrap();
            state.next_payment += 1;
            let recorded = Payment {
                id: PaymentId::new(state.next_payment),
                public_id: payment.public_id,
                booking_id: payment.booking_id,
                user_id: payment.user_id,
                amount: payment.amount,
                status: payment.status,
                created_at: Utc::now(),
            };
            state.payments.push(recorded.clone());
            booking.status = next;
            Ok(recorded)
        })
    }
}
