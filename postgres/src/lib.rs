//! `PostgreSQL` storage for Quicket.
//!
//! - [`PostgresLedger`]: the seat ledger. Booking transactions take the event
//!   row with `FOR UPDATE NOWAIT`, insert the booking and decrement seats with a
//!   relative update, all in one transaction.
//! - [`PostgresEventSnapshots`] / [`PostgresUserSnapshots`]: version-guarded
//!   snapshot tables maintained by the change consumer.
//! - [`PostgresSettlementStore`]: records a payment and settles its booking in
//!   one transaction.
//!
//! # Example
//!
//! ```no_run
//! use quicket_postgres::{PoolSettings, PostgresLedger, connect, migrate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect(&PoolSettings::new("postgres://localhost/quicket")).await?;
//! migrate(&pool).await?;
//! let ledger = PostgresLedger::new(pool);
//! # Ok(())
//! # }
//! ```

mod ledger;
mod settlement;
mod snapshots;

pub use ledger::PostgresLedger;
pub use settlement::PostgresSettlementStore;
pub use snapshots::{PostgresEventSnapshots, PostgresUserSnapshots};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// SQLSTATE raised when `NOWAIT` cannot take a row lock.
const LOCK_NOT_AVAILABLE: &str = "55P03";
/// SQLSTATE raised on foreign key violations.
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Connection URL.
    pub url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// Idle connections kept open.
    pub min_connections: u32,
    /// How long to wait for a connection.
    pub acquire_timeout: Duration,
    /// Close connections idle longer than this.
    pub idle_timeout: Duration,
}

impl PoolSettings {
    /// Defaults for `url`: 20 max, 2 min, 5 s acquire, 10 min idle.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Open a pool.
///
/// # Errors
///
/// Returns the driver error if no connection can be established.
pub async fn connect(settings: &PoolSettings) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .connect(&settings.url)
        .await?;
    tracing::info!(max_connections = settings.max_connections, "PostgreSQL pool connected");
    Ok(pool)
}

/// Apply the bundled migrations.
///
/// # Errors
///
/// Returns the migration error if any script fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

fn has_code(err: &sqlx::Error, code: &str) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(code))
}

fn is_lock_not_available(err: &sqlx::Error) -> bool {
    has_code(err, LOCK_NOT_AVAILABLE)
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_code(err, FOREIGN_KEY_VIOLATION)
}

/// Stored counts are `BIGINT`; domain counts are unsigned.
fn to_db(value: u64) -> Option<i64> {
    i64::try_from(value).ok()
}

fn from_db(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}
