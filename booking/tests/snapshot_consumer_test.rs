//! Snapshot consumer tests.
//!
//! Drives `ChangeConsumer` over the in-memory change bus: ordering and
//! staleness, dead-lettering, bounded redelivery, deadlines, panics,
//! reconnection, and shutdown through `Application`.
//!
//! Run with: `cargo test --test snapshot_consumer_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use async_trait::async_trait;
use booking::runtime::{
    Application, ChangeConsumer, ChangeHandler, EventSnapshotHandler, HandleOutcome, HandlerError,
};
use booking::settlement::{FixedSettlement, POOL_NAME, SettlementJob, SettlementWorker};
use chrono::{TimeZone, Utc};
use quicket_core::change::{ChangeMessage, EventChange, SeatCount, routing_keys};
use quicket_core::change_bus::{ChangeBus, Disposition, Subscription};
use quicket_core::settlement::PaymentStatus;
use quicket_core::snapshot::EventSnapshot;
use quicket_core::types::{BookingId, EventId, Money, PublicId, UserId};
use quicket_runtime::{JobHandler, RetryPolicy, WorkerPool, WorkerPoolConfig};
use quicket_testing::{InMemoryChangeBus, InMemoryEventSnapshots, InMemoryLedger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const TOPIC: &str = "quicket.events";
const DEAD_LETTERS: &str = "quicket.events.dlq";

fn subscription() -> Subscription {
    Subscription::new(TOPIC, "booking-event-snapshots")
        .bind("event.#")
        .dead_letter(DEAD_LETTERS)
}

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

fn created(version: u64) -> ChangeMessage {
    EventChange::Created(snapshot(version, 100)).to_message().unwrap()
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

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct Running {
    bus: InMemoryChangeBus,
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl Running {
    async fn start(
        bus: &InMemoryChangeBus,
        handler: Arc<dyn ChangeHandler>,
        configure: impl FnOnce(ChangeConsumer) -> ChangeConsumer,
    ) -> Self {
        let (shutdown, rx) = broadcast::channel(1);
        let consumer = ChangeConsumer::new(
            "event-snapshots",
            subscription(),
            Arc::new(bus.clone()),
            handler,
            rx,
        )
        .with_retry_delay(Duration::from_millis(10));
        let handle = configure(consumer).spawn();

        eventually("subscription", || bus.subscriptions(TOPIC) == 1).await;
        Self {
            bus: bus.clone(),
            shutdown,
            handle,
        }
    }

    async fn publish(&self, message: &ChangeMessage) {
        self.bus.publish(TOPIC, message).await.unwrap();
    }

    async fn settled(&self, count: usize) -> Vec<Disposition> {
        eventually("settlements", || self.bus.settlements().len() >= count).await;
        self.bus
            .settlements()
            .into_iter()
            .map(|s| s.disposition)
            .collect()
    }

    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("consumer did not stop")
            .unwrap();
    }
}

async fn event_consumer(
    store: &InMemoryEventSnapshots,
    configure: impl FnOnce(ChangeConsumer) -> ChangeConsumer,
) -> Running {
    let bus = InMemoryChangeBus::new();
    let handler = Arc::new(EventSnapshotHandler::new(Arc::new(store.clone())));
    Running::start(&bus, handler, configure).await
}

fn reject_reason(disposition: &Disposition) -> &str {
    match disposition {
        Disposition::Reject { reason } => reason,
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_older_seat_count_does_not_overwrite_newer() {
    let store = InMemoryEventSnapshots::new();
    let running = event_consumer(&store, |c| c).await;

    running.publish(&created(1)).await;
    running.publish(&seats(7, 40)).await;
    running.publish(&seats(5, 90)).await;

    let dispositions = running.settled(3).await;
    assert_eq!(dispositions, vec![Disposition::Ack; 3]);

    let stored = store.get(EventId::new(1)).unwrap();
    assert_eq!(stored.version, 7);
    assert_eq!(stored.available_seats, 40);

    running.stop().await;
}

#[tokio::test]
async fn test_malformed_message_is_dead_lettered() {
    let store = InMemoryEventSnapshots::new();
    let running = event_consumer(&store, |c| c).await;

    let malformed = ChangeMessage::new(routing_keys::EVENT_SEATS_UPDATED, "1", b"not json".to_vec());
    running.publish(&malformed).await;
    running.publish(&created(1)).await;

    let dispositions = running.settled(2).await;
    assert!(matches!(dispositions[0], Disposition::Reject { .. }));
    assert_eq!(dispositions[1], Disposition::Ack);

    let dead = running.bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.routing_key, routing_keys::EVENT_SEATS_UPDATED);
    assert_eq!(running.bus.published(DEAD_LETTERS).len(), 1);
    assert!(store.get(EventId::new(1)).is_some());

    running.stop().await;
}

#[tokio::test]
async fn test_transient_failure_is_redelivered() {
    let store = InMemoryEventSnapshots::new();
    store.fail_next_writes(2);
    let running = event_consumer(&store, |c| c).await;

    running.publish(&created(1)).await;

    let dispositions = running.settled(3).await;
    assert_eq!(
        dispositions,
        vec![Disposition::Requeue, Disposition::Requeue, Disposition::Ack]
    );
    assert_eq!(running.bus.settlements()[2].message.redeliveries, 2);
    assert!(store.get(EventId::new(1)).is_some());
    assert!(running.bus.dead_letters().is_empty());

    running.stop().await;
}

#[tokio::test]
async fn test_redelivery_limit_dead_letters() {
    let store = InMemoryEventSnapshots::new();
    store.fail_next_writes(10);
    let running = event_consumer(&store, |c| c.with_max_redeliveries(1)).await;

    running.publish(&created(1)).await;

    let dispositions = running.settled(2).await;
    assert_eq!(dispositions[0], Disposition::Requeue);
    assert!(reject_reason(&dispositions[1]).ends_with("after 1 redeliveries"));
    assert_eq!(running.bus.dead_letters().len(), 1);
    assert!(store.is_empty());

    running.stop().await;
}

#[tokio::test]
async fn test_unknown_routing_key_is_acknowledged() {
    let store = InMemoryEventSnapshots::new();
    let running = event_consumer(&store, |c| c).await;

    running
        .publish(&ChangeMessage::new("event.archived", "1", b"{}".to_vec()))
        .await;

    assert_eq!(running.settled(1).await, vec![Disposition::Ack]);
    assert!(store.is_empty());

    running.stop().await;
}

/// Panics on messages keyed "boom".
struct Explosive;

#[async_trait]
impl ChangeHandler for Explosive {
    async fn handle(&self, message: &ChangeMessage) -> Result<HandleOutcome, HandlerError> {
        assert_ne!(message.key, "boom", "boom");
        Ok(HandleOutcome::Applied)
    }
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_the_consumer() {
    let bus = InMemoryChangeBus::new();
    let running = Running::start(&bus, Arc::new(Explosive), |c| c).await;

    running
        .publish(&ChangeMessage::new(routing_keys::EVENT_CREATED, "boom", b"{}".to_vec()))
        .await;
    running
        .publish(&ChangeMessage::new(routing_keys::EVENT_CREATED, "fine", b"{}".to_vec()))
        .await;

    let dispositions = running.settled(2).await;
    assert!(reject_reason(&dispositions[0]).starts_with("handler panicked"));
    assert_eq!(dispositions[1], Disposition::Ack);

    running.stop().await;
}

/// Never finishes within any reasonable deadline.
struct Stalled;

#[async_trait]
impl ChangeHandler for Stalled {
    async fn handle(&self, _message: &ChangeMessage) -> Result<HandleOutcome, HandlerError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(HandleOutcome::Applied)
    }
}

#[tokio::test]
async fn test_handler_deadline_is_enforced() {
    let bus = InMemoryChangeBus::new();
    let running = Running::start(&bus, Arc::new(Stalled), |c| {
        c.with_handler_timeout(Duration::from_millis(20))
            .with_max_redeliveries(0)
    })
    .await;

    running.publish(&created(1)).await;

    let dispositions = running.settled(1).await;
    assert_eq!(
        reject_reason(&dispositions[0]),
        "handler timed out after 0 redeliveries"
    );

    running.stop().await;
}

#[tokio::test]
async fn test_consumer_resubscribes_after_stream_ends() {
    let store = InMemoryEventSnapshots::new();
    let running = event_consumer(&store, |c| c).await;

    running.bus.close();
    eventually("resubscription", || running.bus.subscriptions(TOPIC) == 1).await;

    running.publish(&created(1)).await;
    assert_eq!(running.settled(1).await, vec![Disposition::Ack]);
    assert!(store.get(EventId::new(1)).is_some());

    running.stop().await;
}

#[tokio::test]
async fn test_application_drains_consumers_and_pool() {
    let bus = InMemoryChangeBus::new();
    let store = InMemoryEventSnapshots::new();
    let (shutdown_tx, _) = broadcast::channel(1);

    let consumer = ChangeConsumer::new(
        "event-snapshots",
        subscription(),
        Arc::new(bus.clone()),
        Arc::new(EventSnapshotHandler::new(Arc::new(store.clone()))),
        shutdown_tx.subscribe(),
    );

    let ledger = InMemoryLedger::new();
    let handler: Arc<dyn JobHandler<SettlementJob>> = Arc::new(SettlementWorker::new(
        Arc::new(FixedSettlement(PaymentStatus::Success)),
        Arc::new(ledger),
        RetryPolicy::none(),
    ));
    let pool = Arc::new(WorkerPool::start(
        POOL_NAME,
        WorkerPoolConfig::new(1, 4),
        handler,
    ));

    let application = Application::new(
        vec![consumer],
        pool.clone(),
        shutdown_tx,
        Duration::from_secs(5),
    );

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(application.run_until(async {
        let _ = stop_rx.await;
    }));

    eventually("subscription", || bus.subscriptions(TOPIC) == 1).await;
    bus.publish(TOPIC, &created(1)).await.unwrap();
    eventually("snapshot", || store.get(EventId::new(1)).is_some()).await;

    stop_tx.send(()).unwrap();
    assert!(running.await.unwrap());
    assert!(pool.submit(SettlementJob {
        booking_id: BookingId::new(1),
        user_id: UserId::new(1),
        amount: Money::from_cents(100),
        payment_public_id: PublicId::new(),
    })
    .is_err());
}
