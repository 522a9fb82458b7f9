//! Wiring of the booking service.
//!
//! Startup happens in two steps so tests can swap the backends:
//!
//! ```rust,ignore
//! // Step 1: open the pool, run migrations, create the change bus
//! let backends = Backends::connect(&config).await?;
//!
//! // Step 2: build the publisher, settlement pool, service and consumers
//! let components = assemble(&config, backends);
//!
//! components.application.run().await;
//! ```

use crate::catalog::EventCatalog;
use crate::config::Config;
use crate::error::BootstrapError;
use crate::publisher::ChangePublisher;
use crate::runtime::{Application, ChangeConsumer, EventSnapshotHandler, UserSnapshotHandler};
use crate::service::BookingService;
use crate::settlement::{SettlementWorker, SimulatedSettlement, start_pool};
use quicket_core::change_bus::{ChangeBus, Subscription};
use quicket_core::ledger::{EventRegistry, SeatLedger};
use quicket_core::settlement::SettlementStore;
use quicket_core::snapshot::{EventSnapshotStore, UserSnapshotStore};
use quicket_postgres::{
    PostgresEventSnapshots, PostgresLedger, PostgresSettlementStore, PostgresUserSnapshots,
};
use quicket_redpanda::RedpandaChangeBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Storage and messaging the service runs on.
#[derive(Clone)]
pub struct Backends {
    /// Seat ledger.
    pub ledger: Arc<dyn SeatLedger>,
    /// Event rows of the ledger.
    pub registry: Arc<dyn EventRegistry>,
    /// Payment records.
    pub settlements: Arc<dyn SettlementStore>,
    /// Event snapshots.
    pub events: Arc<dyn EventSnapshotStore>,
    /// User snapshots.
    pub users: Arc<dyn UserSnapshotStore>,
    /// Change bus.
    pub bus: Arc<dyn ChangeBus>,
}

impl Backends {
    /// Connect to `PostgreSQL` and Redpanda.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] if the pool cannot be opened, migrations
    /// fail, or the bus cannot be created.
    pub async fn connect(config: &Config) -> Result<Self, BootstrapError> {
        info!("Connecting to PostgreSQL...");
        let pool = quicket_postgres::connect(&config.postgres.pool_settings()).await?;
        quicket_postgres::migrate(&pool).await?;

        info!(brokers = %config.redpanda.brokers, "Connecting to Redpanda...");
        let bus = RedpandaChangeBus::builder()
            .brokers(config.redpanda.brokers.clone())
            .producer_acks(config.redpanda.producer_acks.clone())
            .build()?;

        let ledger = Arc::new(PostgresLedger::new(pool.clone()));
        Ok(Self {
            ledger: ledger.clone(),
            registry: ledger,
            settlements: Arc::new(PostgresSettlementStore::new(pool.clone())),
            events: Arc::new(PostgresEventSnapshots::new(pool.clone())),
            users: Arc::new(PostgresUserSnapshots::new(pool)),
            bus: Arc::new(bus),
        })
    }
}

/// Everything the process runs.
pub struct Components {
    /// Booking use case.
    pub service: BookingService,
    /// Event management.
    pub catalog: EventCatalog,
    /// Change publisher shared by the service and the catalog.
    pub publisher: ChangePublisher,
    /// Consumers and settlement pool, ready to run.
    pub application: Application,
}

/// Build the service, consumers and settlement pool on top of `backends`.
///
/// Must be called within a Tokio runtime: the settlement pool starts here.
#[must_use]
pub fn assemble(config: &Config, backends: Backends) -> Components {
    let (shutdown_tx, _) = broadcast::channel(16);

    let publisher = ChangePublisher::new(
        backends.bus.clone(),
        config.redpanda.events_topic.clone(),
        config.redpanda.users_topic.clone(),
    );

    let worker = SettlementWorker::new(
        Arc::new(SimulatedSettlement::from_config(&config.settlement)),
        backends.settlements.clone(),
        config.booking.retry_policy(),
    );
    let settlement = Arc::new(start_pool(&config.settlement, worker));

    let service = BookingService::new(
        backends.ledger.clone(),
        backends.registry.clone(),
        backends.events.clone(),
        backends.users.clone(),
        publisher.clone(),
        settlement.clone(),
    )
    .with_hold(config.booking.hold())
    .with_retry(config.booking.retry_policy());

    let catalog = EventCatalog::new(backends.registry.clone(), publisher.clone());

    let redpanda = &config.redpanda;
    let events = Subscription::new(
        redpanda.events_topic.clone(),
        format!("{}-event-snapshots", redpanda.consumer_group),
    )
    .bind("event.#")
    .dead_letter(redpanda.events_dead_letter_topic.clone());
    let users = Subscription::new(
        redpanda.users_topic.clone(),
        format!("{}-user-snapshots", redpanda.consumer_group),
    )
    .bind("user.#")
    .dead_letter(redpanda.users_dead_letter_topic.clone());

    let consumers = vec![
        consumer(
            config,
            ChangeConsumer::new(
                "event-snapshots",
                events,
                backends.bus.clone(),
                Arc::new(EventSnapshotHandler::new(backends.events.clone())),
                shutdown_tx.subscribe(),
            ),
        ),
        consumer(
            config,
            ChangeConsumer::new(
                "user-snapshots",
                users,
                backends.bus.clone(),
                Arc::new(UserSnapshotHandler::new(backends.users.clone())),
                shutdown_tx.subscribe(),
            ),
        ),
    ];

    let application = Application::new(
        consumers,
        settlement,
        shutdown_tx,
        config.shutdown_timeout(),
    );

    Components {
        service,
        catalog,
        publisher,
        application,
    }
}

fn consumer(config: &Config, consumer: ChangeConsumer) -> ChangeConsumer {
    consumer
        .with_handler_timeout(Duration::from_millis(config.consumer.handler_timeout_ms))
        .with_max_redeliveries(config.consumer.max_redeliveries)
        .with_retry_delay(Duration::from_millis(config.consumer.reconnect_delay_ms))
}

/// Connect to the configured backends and assemble the process.
///
/// # Errors
///
/// Returns [`BootstrapError`] if a backend is unreachable.
pub async fn build(config: &Config) -> Result<Components, BootstrapError> {
    let backends = Backends::connect(config).await?;
    let components = assemble(config, backends);
    info!("Booking service assembled");
    Ok(components)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use quicket_core::change::{ChangeMessage, routing_keys};
    use quicket_core::snapshot::EventSnapshot;
    use quicket_testing::{
        InMemoryChangeBus, InMemoryEventSnapshots, InMemoryLedger, InMemoryUserSnapshots,
        fixtures,
    };

    fn backends(bus: &InMemoryChangeBus, events: &InMemoryEventSnapshots) -> Backends {
        let ledger = Arc::new(InMemoryLedger::default());
        Backends {
            ledger: ledger.clone(),
            registry: ledger.clone(),
            settlements: ledger,
            events: Arc::new(events.clone()),
            users: Arc::new(InMemoryUserSnapshots::new()),
            bus: Arc::new(bus.clone()),
        }
    }

    #[tokio::test]
    async fn test_registered_event_reaches_snapshot_store() {
        let config = Config::from_lookup(|_| None);
        let bus = InMemoryChangeBus::new();
        let events = InMemoryEventSnapshots::new();
        let components = assemble(&config, backends(&bus, &events));

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(components.application.run_until(async {
            let _ = stop_rx.await;
        }));

        while bus.subscriptions(&config.redpanda.events_topic) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let event = components
            .catalog
            .register(fixtures::new_event("RustConf", 50))
            .await
            .unwrap();

        let stored = async {
            loop {
                if let Some(snapshot) = events.get(event.id) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        let stored = tokio::time::timeout(Duration::from_secs(5), stored)
            .await
            .unwrap();
        assert_eq!(stored, EventSnapshot::from(&event));

        let found = components.service.event(event.public_id).await.unwrap();
        assert_eq!(found.available_seats, 50);

        stop_tx.send(()).unwrap();
        assert!(running.await.unwrap());
    }

    #[tokio::test]
    async fn test_consumers_only_bind_their_own_keys() {
        let config = Config::from_lookup(|_| None);
        let bus = InMemoryChangeBus::new();
        let events = InMemoryEventSnapshots::new();
        let components = assemble(&config, backends(&bus, &events));

        assert_eq!(components.publisher.events_topic(), config.redpanda.events_topic);
        assert_eq!(components.publisher.users_topic(), config.redpanda.users_topic);

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(components.application.run_until(async {
            let _ = stop_rx.await;
        }));
        while bus.subscriptions(&config.redpanda.users_topic) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stray = ChangeMessage::new(routing_keys::EVENT_CREATED, "7", b"{}".to_vec());
        bus.publish(&config.redpanda.users_topic, &stray).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bus.settlements().is_empty());

        stop_tx.send(()).unwrap();
        assert!(running.await.unwrap());
    }
}
