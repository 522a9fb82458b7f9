//! # Quicket Testing
//!
//! In-memory doubles for every storage and messaging seam, plus fixtures.
//!
//! - [`InMemoryLedger`]: seat ledger, event registry and settlement store with
//!   real no-wait row locks
//! - [`InMemoryEventSnapshots`] / [`InMemoryUserSnapshots`]: version-guarded stores
//! - [`InMemoryChangeBus`]: records publishes and settlements, redelivers requeued messages
//! - [`FixedClock`], [`SequentialIds`]: deterministic environment
//!
//! ## Example
//!
//! ```
//! use quicket_testing::{InMemoryLedger, fixtures};
//!
//! let ledger = InMemoryLedger::new();
//! let event = ledger.seed_event(fixtures::new_event("RustConf", 5));
//! assert_eq!(ledger.available_seats(event.id), Some(5));
//! ```

pub mod change_bus;
pub mod ledger;
pub mod snapshots;

use chrono::{DateTime, Utc};
use quicket_core::environment::{Clock, IdGenerator};
use quicket_core::types::PublicId;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, IdGenerator, PublicId, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until moved with [`FixedClock::advance`].
    ///
    /// # Example
    ///
    /// ```
    /// use quicket_testing::mocks::FixedClock;
    /// use quicket_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward. Clones share the same time.
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap();
            *time += by;
        }
    }

    impl Clock for FixedClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2030-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// Never in practice; the timestamp is hardcoded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Predictable public ids: `00000000-0000-0000-0000-000000000001`, `...02`, ...
    #[derive(Debug, Default)]
    pub struct SequentialIds {
        next: AtomicU64,
    }

    impl SequentialIds {
        /// Start at 1.
        #[must_use]
        pub const fn new() -> Self {
            Self {
                next: AtomicU64::new(0),
            }
        }

        /// The `n`th id this generator hands out.
        #[must_use]
        pub fn nth(n: u64) -> PublicId {
            PublicId::from_uuid(uuid::Uuid::from_u128(u128::from(n)))
        }
    }

    impl IdGenerator for SequentialIds {
        fn public_id(&self) -> PublicId {
            Self::nth(self.next.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }
}

/// Builders for common test data.
pub mod fixtures {
    use chrono::{Duration, TimeZone, Utc};
    use quicket_core::ledger::NewEvent;
    use quicket_core::types::{Money, PublicId, UserId};
    use quicket_core::snapshot::UserSnapshot;

    /// An event starting 30 days after the test clock, lasting two days, at 25.00 a seat.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn new_event(title: &str, seats: u64) -> NewEvent {
        let start = Utc.with_ymd_and_hms(2030, 1, 31, 9, 0, 0).unwrap();
        NewEvent {
            public_id: PublicId::new(),
            title: title.to_string(),
            start_date: start,
            end_date: start + Duration::days(2),
            total_seats: seats,
            ticket_price: Money::from_cents(2_500),
        }
    }

    /// A user snapshot at version 1.
    #[must_use]
    pub fn user(id: i64) -> UserSnapshot {
        UserSnapshot {
            id: UserId::new(id),
            public_id: PublicId::new(),
            version: 1,
        }
    }
}

pub use change_bus::InMemoryChangeBus;
pub use ledger::InMemoryLedger;
pub use mocks::{FixedClock, SequentialIds, test_clock};
pub use snapshots::{InMemoryEventSnapshots, InMemoryUserSnapshots};
