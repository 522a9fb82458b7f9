//! Booking service tests.
//!
//! Races for the last seats, refusals that must leave the ledger untouched,
//! seat announcements, and settlement hand-off under a full queue.
//!
//! Run with: `cargo test --test booking_service_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use booking::publisher::ChangePublisher;
use booking::{
    BookingError, BookingService, BookingView, ErrorKind, FixedSettlement, SettlementDecider, SettlementJob,
    SettlementWorker,
};
use booking::settlement::POOL_NAME;
use futures::future::{BoxFuture, join_all};
use proptest::prelude::*;
use quicket_core::booking::BookingStatus;
use quicket_core::change::EventChange;
use quicket_core::environment::Clock;
use quicket_core::ledger::LedgerEvent;
use quicket_core::settlement::PaymentStatus;
use quicket_core::snapshot::{EventSnapshot, EventSnapshotStore, UserSnapshot, UserSnapshotStore};
use quicket_core::types::{Money, PublicId};
use quicket_runtime::{JobHandler, RetryPolicy, WorkerPool, WorkerPoolConfig};
use quicket_testing::{
    FixedClock, InMemoryChangeBus, InMemoryEventSnapshots, InMemoryLedger, InMemoryUserSnapshots,
    SequentialIds, fixtures, test_clock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const EVENTS_TOPIC: &str = "quicket.events";
const USERS_TOPIC: &str = "quicket.users";

struct Harness {
    ledger: InMemoryLedger,
    bus: InMemoryChangeBus,
    clock: FixedClock,
    pool: Arc<WorkerPool<SettlementJob>>,
    service: BookingService,
    event: LedgerEvent,
    user: UserSnapshot,
}

impl Harness {
    async fn new(seats: u64) -> Self {
        Self::with_pool(seats, FixedSettlement(PaymentStatus::Success), 2, 64).await
    }

    async fn with_pool(
        seats: u64,
        decider: impl SettlementDecider + 'static,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let ledger = InMemoryLedger::new();
        let events = InMemoryEventSnapshots::new();
        let users = InMemoryUserSnapshots::new();
        let bus = InMemoryChangeBus::new();
        let clock = test_clock();

        let event = ledger.seed_event(fixtures::new_event("RustConf", seats));
        events.insert(EventSnapshot::from(&event)).await.unwrap();
        let user = fixtures::user(1);
        users.insert(user.clone()).await.unwrap();

        let worker = SettlementWorker::new(
            Arc::new(decider),
            Arc::new(ledger.clone()),
            RetryPolicy::none(),
        );
        let handler: Arc<dyn JobHandler<SettlementJob>> = Arc::new(worker);
        let pool = Arc::new(WorkerPool::start(
            POOL_NAME,
            WorkerPoolConfig::new(workers, capacity),
            handler,
        ));

        let publisher = ChangePublisher::new(Arc::new(bus.clone()), EVENTS_TOPIC, USERS_TOPIC);
        let service = BookingService::new(
            Arc::new(ledger.clone()),
            Arc::new(ledger.clone()),
            Arc::new(events),
            Arc::new(users),
            publisher,
            pool.clone(),
        )
        .with_clock(Arc::new(clock.clone()))
        .with_ids(Arc::new(SequentialIds::new()))
        .with_retry(
            RetryPolicy::builder()
                .max_retries(10)
                .initial_delay(Duration::from_millis(5))
                .max_delay(Duration::from_millis(5))
                .build(),
        );

        Self {
            ledger,
            bus,
            clock,
            pool,
            service,
            event,
            user,
        }
    }

    async fn book(&self, seats: u32) -> Result<BookingView, BookingError> {
        self.service
            .create(self.event.public_id, self.user.public_id, seats)
            .await
    }

    fn seat_changes(&self) -> Vec<EventChange> {
        self.bus
            .published(EVENTS_TOPIC)
            .iter()
            .map(|m| EventChange::decode(m).unwrap().unwrap())
            .collect()
    }
}

/// Holds every settlement until a permit is released.
struct GatedSettlement(Arc<Semaphore>);

impl SettlementDecider for GatedSettlement {
    fn decide<'a>(&'a self, _job: &'a SettlementJob) -> BoxFuture<'a, PaymentStatus> {
        Box::pin(async move {
            let _permit = self.0.acquire().await.expect("semaphore closed");
            PaymentStatus::Success
        })
    }
}

#[tokio::test]
async fn test_booking_reserves_seats_and_prices_from_ledger() {
    let h = Harness::new(5).await;

    let view = h.book(3).await.unwrap();

    assert_eq!(view.seats, 3);
    assert_eq!(view.total, Money::from_cents(7_500));
    assert_eq!(view.event_public_id, h.event.public_id);
    assert_eq!(view.public_id, SequentialIds::nth(1));
    assert_eq!(view.expires_at, h.clock.now() + chrono::Duration::minutes(5));
    assert_eq!(h.ledger.available_seats(h.event.id), Some(2));
}

#[tokio::test]
async fn test_booking_view_exposes_public_ids_only() {
    let h = Harness::new(5).await;

    let view = h.book(1).await.unwrap();
    let json = serde_json::to_value(&view).unwrap();

    assert_eq!(json["public_id"], view.public_id.to_string());
    assert_eq!(json["event_public_id"], h.event.public_id.to_string());
    assert_eq!(json["status"], "pending");
    assert_eq!(json["total"], 2_500);
    assert!(json.get("id").is_none());
    assert!(json.get("user_id").is_none());
}

#[tokio::test]
async fn test_concurrent_bookings_for_last_seats() {
    let h = Harness::new(5).await;
    h.ledger.set_hold(Duration::from_millis(20));

    let first = {
        let service = h.service.clone();
        let (event, user) = (h.event.public_id, h.user.public_id);
        tokio::spawn(async move { service.create(event, user, 3).await })
    };
    let second = {
        let service = h.service.clone();
        let (event, user) = (h.event.public_id, h.user.public_id);
        tokio::spawn(async move { service.create(event, user, 3).await })
    };

    let results = [first.await.unwrap(), second.await.unwrap()];
    let created = results.iter().filter(|r| r.is_ok()).count();
    let refused: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();

    assert_eq!(created, 1);
    assert_eq!(
        refused,
        vec![&BookingError::SeatsUnavailable {
            requested: 3,
            available: 2,
        }]
    );
    assert_eq!(h.ledger.available_seats(h.event.id), Some(2));
    assert_eq!(h.ledger.bookings().len(), 1);
}

#[tokio::test]
async fn test_contention_past_retry_budget_is_busy() {
    let h = Harness::new(5).await;
    let guard = h.ledger.lock_event(h.event.id).await.unwrap();

    let result = h.book(1).await;
    drop(guard);

    assert_eq!(result, Err(BookingError::Busy));
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Unavailable);
    assert_eq!(h.ledger.available_seats(h.event.id), Some(5));
}

#[tokio::test]
async fn test_expired_event_is_refused_before_the_ledger() {
    let h = Harness::new(5).await;
    h.clock.advance(chrono::Duration::days(60));

    let result = h.book(1).await;

    assert_eq!(
        result,
        Err(BookingError::EventExpired {
            event: h.event.public_id,
            ended_at: h.event.end_date,
        })
    );
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Conflict);
    assert_eq!(h.ledger.available_seats(h.event.id), Some(5));
    assert!(h.ledger.bookings().is_empty());
    assert!(h.bus.published(EVENTS_TOPIC).is_empty());
}

#[tokio::test]
async fn test_unknown_event_user_and_zero_seats() {
    let h = Harness::new(5).await;
    let stranger = PublicId::new();

    assert_eq!(
        h.service.create(stranger, h.user.public_id, 1).await,
        Err(BookingError::EventNotFound(stranger))
    );
    assert_eq!(
        h.service.create(h.event.public_id, stranger, 1).await,
        Err(BookingError::UserNotFound(stranger))
    );
    assert_eq!(h.book(0).await, Err(BookingError::InvalidSeats));
    assert!(h.ledger.bookings().is_empty());
}

#[tokio::test]
async fn test_failed_insert_leaves_nothing_behind() {
    let h = Harness::new(5).await;
    let service = h.service.clone().with_retry(RetryPolicy::none());
    h.ledger.fail_next_insert();

    let result = service.create(h.event.public_id, h.user.public_id, 2).await;

    assert!(matches!(result, Err(BookingError::Ledger(_))));
    assert_eq!(h.ledger.available_seats(h.event.id), Some(5));
    assert!(h.ledger.bookings().is_empty());
    assert!(h.bus.published(EVENTS_TOPIC).is_empty());
}

#[tokio::test]
async fn test_seat_count_is_announced_with_ledger_version() {
    let h = Harness::new(5).await;

    h.book(3).await.unwrap();

    let changes = h.seat_changes();
    assert_eq!(changes.len(), 1);
    let EventChange::SeatsUpdated(count) = &changes[0] else {
        panic!("expected a seat update, got {:?}", changes[0]);
    };
    assert_eq!(count.id, h.event.id);
    assert_eq!(count.public_id, h.event.public_id);
    assert_eq!(count.available_seats, 2);
    assert_eq!(count.version, 2);
}

#[tokio::test]
async fn test_publish_failure_does_not_fail_the_booking() {
    let h = Harness::new(5).await;
    h.bus.fail_publishes(true);

    let view = h.book(1).await.unwrap();

    assert_eq!(view.seats, 1);
    assert_eq!(h.ledger.available_seats(h.event.id), Some(4));
    assert!(h.bus.published(EVENTS_TOPIC).is_empty());

    // Settlement is still handed off after the failed announcement.
    assert!(h.pool.shutdown(Duration::from_secs(5)).await);
    assert_eq!(h.ledger.payments().len(), 1);
}

#[tokio::test]
async fn test_booking_is_settled_in_background() {
    let h = Harness::new(5).await;

    let view = h.book(2).await.unwrap();
    assert_eq!(view.status, BookingStatus::Pending);

    assert!(h.pool.shutdown(Duration::from_secs(5)).await);

    let settled = h.service.find(view.public_id).await.unwrap();
    assert_eq!(settled.status, BookingStatus::Success);
    let payments = h.ledger.payments();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].amount, Money::from_cents(5_000));
}

#[tokio::test]
async fn test_full_settlement_queue_does_not_block_bookings() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::with_pool(10, GatedSettlement(gate.clone()), 1, 1).await;

    for _ in 0..4 {
        let view = tokio::time::timeout(Duration::from_secs(1), h.book(1))
            .await
            .expect("booking blocked on the settlement queue")
            .unwrap();
        assert_eq!(view.status, BookingStatus::Pending);
    }
    assert_eq!(h.ledger.available_seats(h.event.id), Some(6));

    gate.add_permits(4);
    assert!(h.pool.shutdown(Duration::from_secs(5)).await);

    let payments = h.ledger.payments().len();
    assert!((1..4).contains(&payments), "{payments} payments recorded");
    let pending = h
        .ledger
        .bookings()
        .iter()
        .filter(|b| b.status == BookingStatus::Pending)
        .count();
    assert_eq!(pending, 4 - payments);
}

#[tokio::test]
async fn test_find_unknown_booking() {
    let h = Harness::new(5).await;
    let missing = PublicId::new();

    assert_eq!(
        h.service.find(missing).await,
        Err(BookingError::BookingNotFound(missing))
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn bookings_never_oversell(
        capacity in 0u64..20,
        requests in prop::collection::vec(1u32..6, 1..12),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let h = Harness::new(capacity).await;
            // Every transaction sleeps with the row held, so the requests
            // interleave and collide on the lock.
            h.ledger.set_hold(Duration::from_millis(1));

            let results = join_all(requests.iter().map(|&seats| h.book(seats))).await;

            let created: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            let booked: u64 = created.iter().map(|v| u64::from(v.seats)).sum();
            prop_assert!(booked <= capacity);
            prop_assert_eq!(h.ledger.available_seats(h.event.id), Some(capacity - booked));
            prop_assert_eq!(h.ledger.bookings().len(), created.len());
            for result in &results {
                if let Err(e) = result {
                    let refused = matches!(
                        e,
                        BookingError::SeatsUnavailable { .. } | BookingError::Busy
                    );
                    prop_assert!(refused, "unexpected error {e}");
                }
            }
            Ok(())
        })?;
    }
}
