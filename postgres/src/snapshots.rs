//! Version-guarded snapshot tables.
//!
//! Guards live in SQL so concurrent consumers cannot interleave a read and a
//! write: `ON CONFLICT ... WHERE version <= EXCLUDED.version` for upserts and
//! `WHERE version <= $n` for seat updates. The affected row count tells
//! applied from skipped.

use crate::{from_db, to_db};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use quicket_core::snapshot::{
    ApplyOutcome, EventSnapshot, EventSnapshotStore, SnapshotError, UserSnapshot,
    UserSnapshotStore,
};
use quicket_core::types::{EventId, Money, PublicId, UserId};
use sqlx::PgPool;
use sqlx::postgres::PgQueryResult;
use uuid::Uuid;

fn storage(err: sqlx::Error) -> SnapshotError {
    SnapshotError::Storage(err.to_string())
}

fn outcome(result: PgQueryResult) -> ApplyOutcome {
    ApplyOutcome::from_rows(result.rows_affected())
}

fn column(value: u64, name: &str) -> Result<i64, SnapshotError> {
    to_db(value).ok_or_else(|| SnapshotError::Corrupt(format!("{name} out of range: {value}")))
}

fn count(value: i64, name: &str) -> Result<u64, SnapshotError> {
    from_db(value).ok_or_else(|| SnapshotError::Corrupt(format!("Negative {name}: {value}")))
}

#[derive(sqlx::FromRow)]
struct EventSnapshotRow {
    id: i64,
    public_id: Uuid,
    title: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    available_seats: i64,
    ticket_price_cents: i64,
    version: i64,
}

impl TryFrom<EventSnapshotRow> for EventSnapshot {
    type Error = SnapshotError;

    fn try_from(row: EventSnapshotRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: EventId::new(row.id),
            public_id: PublicId::from_uuid(row.public_id),
            title: row.title,
            start_date: row.start_date,
            end_date: row.end_date,
            available_seats: count(row.available_seats, "available_seats")?,
            ticket_price: Money::from_cents(row.ticket_price_cents),
            version: count(row.version, "version")?,
        })
    }
}

/// Event snapshots on `PostgreSQL`.
#[derive(Clone, Debug)]
pub struct PostgresEventSnapshots {
    pool: PgPool,
}

impl PostgresEventSnapshots {
    /// Use an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write(&self, snapshot: &EventSnapshot, on_conflict: &str) -> Result<ApplyOutcome, SnapshotError> {
        let sql = format!(
            "INSERT INTO event_snapshots \
             (id, public_id, title, start_date, end_date, available_seats, ticket_price_cents, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) {on_conflict}"
        );
        let result = sqlx::query(&sql)
            .bind(snapshot.id.get())
            .bind(*snapshot.public_id.as_uuid())
            .bind(&snapshot.title)
            .bind(snapshot.start_date)
            .bind(snapshot.end_date)
            .bind(column(snapshot.available_seats, "available_seats")?)
            .bind(snapshot.ticket_price.cents())
            .bind(column(snapshot.version, "version")?)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(outcome(result))
    }
}

impl EventSnapshotStore for PostgresEventSnapshots {
    fn insert(&self, snapshot: EventSnapshot) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move { self.write(&snapshot, "DO NOTHING").await })
    }

    fn upsert(&self, snapshot: EventSnapshot) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move {
            self.write(
                &snapshot,
                "DO UPDATE SET \
                 public_id = EXCLUDED.public_id, title = EXCLUDED.title, \
                 start_date = EXCLUDED.start_date, end_date = EXCLUDED.end_date, \
                 available_seats = EXCLUDED.available_seats, \
                 ticket_price_cents = EXCLUDED.ticket_price_cents, \
                 version = EXCLUDED.version, updated_at = now() \
                 WHERE event_snapshots.version <= EXCLUDED.version",
            )
            .await
        })
    }

    fn update_seats(
        &self,
        id: EventId,
        available_seats: u64,
        version: u64,
    ) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE event_snapshots \
                 SET available_seats = $2, version = $3, updated_at = now() \
                 WHERE id = $1 AND version <= $3",
            )
            .bind(id.get())
            .bind(column(available_seats, "available_seats")?)
            .bind(column(version, "version")?)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
            Ok(outcome(result))
        })
    }

    fn delete(&self, id: EventId) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM event_snapshots WHERE id = $1")
                .bind(id.get())
                .execute(&self.pool)
                .await
                .map_err(storage)?;
            Ok(outcome(result))
        })
    }

    fn find_by_public_id(
        &self,
        public_id: PublicId,
    ) -> BoxFuture<'_, Result<Option<EventSnapshot>, SnapshotError>> {
        Box::pin(async move {
            let row: Option<EventSnapshotRow> = sqlx::query_as(
                "SELECT id, public_id, title, start_date, end_date, available_seats, \
                 ticket_price_cents, version \
                 FROM event_snapshots WHERE public_id = $1",
            )
            .bind(*public_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
            row.map(EventSnapshot::try_from).transpose()
        })
    }
}

/// User snapshots on `PostgreSQL`.
#[derive(Clone, Debug)]
pub struct PostgresUserSnapshots {
    pool: PgPool,
}

impl PostgresUserSnapshots {
    /// Use an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write(&self, snapshot: &UserSnapshot, on_conflict: &str) -> Result<ApplyOutcome, SnapshotError> {
        let sql = format!(
            "INSERT INTO user_snapshots (id, public_id, version) VALUES ($1, $2, $3) \
             ON CONFLICT (id) {on_conflict}"
        );
        let result = sqlx::query(&sql)
            .bind(snapshot.id.get())
            .bind(*snapshot.public_id.as_uuid())
            .bind(column(snapshot.version, "version")?)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(outcome(result))
    }
}

impl UserSnapshotStore for PostgresUserSnapshots {
    fn insert(&self, snapshot: UserSnapshot) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move { self.write(&snapshot, "DO NOTHING").await })
    }

    fn upsert(&self, snapshot: UserSnapshot) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move {
            self.write(
                &snapshot,
                "DO UPDATE SET public_id = EXCLUDED.public_id, version = EXCLUDED.version, \
                 updated_at = now() \
                 WHERE user_snapshots.version <= EXCLUDED.version",
            )
            .await
        })
    }

    fn delete(&self, id: UserId) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM user_snapshots WHERE id = $1")
                .bind(id.get())
                .execute(&self.pool)
                .await
                .map_err(storage)?;
            Ok(outcome(result))
        })
    }

    fn find_by_public_id(
        &self,
        public_id: PublicId,
    ) -> BoxFuture<'_, Result<Option<UserSnapshot>, SnapshotError>> {
        Box::pin(async move {
            let row: Option<(i64, Uuid, i64)> =
                sqlx::query_as("SELECT id, public_id, version FROM user_snapshots WHERE public_id = $1")
                    .bind(*public_id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(storage)?;
            row.map(|(id, public_id, version)| {
                Ok(UserSnapshot {
                    id: UserId::new(id),
                    public_id: PublicId::from_uuid(public_id),
                    version: count(version, "version")?,
                })
            })
            .transpose()
        })
    }
}
