//! # Quicket Core
//!
//! Domain types and abstractions for the Quicket seat-reservation engine.
//!
//! The engine keeps three things consistent under concurrency:
//!
//! - **Seat Ledger**: the authoritative event row whose available seat count is
//!   decremented inside the same transaction that inserts a booking.
//! - **Snapshots**: versioned local copies of events and users, fed only by
//!   change messages and never rolled back by stale deliveries.
//! - **Settlement**: asynchronous payment outcomes that move a booking out of
//!   `pending` exactly once.
//!
//! This crate holds no I/O. Storage lives in `quicket-postgres`, messaging in
//! `quicket-redpanda`, and in-memory doubles in `quicket-testing`.
//!
//! ## Modules
//!
//! - [`types`]: identifiers and [`types::Money`]
//! - [`booking`]: bookings and their status machine
//! - [`ledger`]: seat ledger and event registry traits
//! - [`snapshot`]: snapshot records and store traits
//! - [`change`]: change messages, routing keys and decoding
//! - [`change_bus`]: publish/subscribe abstraction with explicit acknowledgement
//! - [`settlement`]: payment records and the settlement store
//! - [`environment`]: injectable clock and id generator

pub mod booking;
pub mod change;
pub mod change_bus;
pub mod ledger;
pub mod settlement;
pub mod snapshot;
pub mod types;

/// Environment traits - injected dependencies for deterministic tests.
pub mod environment {
    use crate::types::PublicId;
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Source of public identifiers.
    pub trait IdGenerator: Send + Sync {
        /// Produce a fresh, never reused public id.
        fn public_id(&self) -> PublicId;
    }

    /// Random UUID v4 generator.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UuidGenerator;

    impl IdGenerator for UuidGenerator {
        fn public_id(&self) -> PublicId {
            PublicId::new()
        }
    }
}

pub use booking::{Booking, BookingReceipt, BookingRequest, BookingStatus};
pub use change::{ChangeError, ChangeMessage, EventChange, RoutingPattern, UserChange};
pub use change_bus::{ChangeBus, ChangeBusError, Delivery, DeliveryStream, Disposition, Subscription};
pub use ledger::{EventRegistry, EventRevision, LedgerError, LedgerEvent, NewEvent, SeatLedger};
pub use settlement::{NewPayment, Payment, PaymentStatus, SettlementError, SettlementStore};
pub use snapshot::{
    ApplyOutcome, EventSnapshot, EventSnapshotStore, SnapshotError, UserSnapshot,
    UserSnapshotStore,
};
pub use types::{BookingId, EventId, Money, PaymentId, PublicId, UserId};
