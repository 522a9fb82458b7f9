//! Settlement transaction on `PostgreSQL`.

use crate::is_lock_not_available;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use quicket_core::booking::BookingStatus;
use quicket_core::settlement::{NewPayment, Payment, SettlementError, SettlementStore};
use quicket_core::types::PaymentId;
use sqlx::PgPool;

fn storage(err: sqlx::Error) -> SettlementError {
    SettlementError::Storage(err.to_string())
}

/// `PostgreSQL` implementation of [`SettlementStore`].
#[derive(Clone, Debug)]
pub struct PostgresSettlementStore {
    pool: PgPool,
}

impl PostgresSettlementStore {
    /// Use an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn settle(&self, payment: NewPayment) -> Result<Payment, SettlementError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM bookings WHERE id = $1 FOR UPDATE NOWAIT")
                .bind(payment.booking_id.get())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| {
                    if is_lock_not_available(&e) {
                        SettlementError::LockContention
                    } else {
                        storage(e)
                    }
                })?;

        let Some((status,)) = status else {
            return Err(SettlementError::BookingNotFound(payment.booking_id));
        };
        let current = BookingStatus::parse(&status)
            .ok_or_else(|| SettlementError::Storage(format!("Invalid booking status: {status}")))?;
        let next = payment.status.booking_status();
        if !current.can_transition_to(next) {
            return Err(SettlementError::AlreadySettled {
                booking_id: payment.booking_id,
                status: current,
            });
        }

        let (id, created_at): (i64, DateTime<Utc>) = sqlx::query_as(
            "INSERT INTO payments (public_id, booking_id, user_id, amount_cents, status) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id, created_at",
        )
        .bind(*payment.public_id.as_uuid())
        .bind(payment.booking_id.get())
        .bind(payment.user_id.get())
        .bind(payment.amount.cents())
        .bind(payment.status.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query("UPDATE bookings SET status = $2, updated_at = now() WHERE id = $1")
            .bind(payment.booking_id.get())
            .bind(next.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        Ok(Payment {
            id: PaymentId::new(id),
            public_id: payment.public_id,
            booking_id: payment.booking_id,
            user_id: payment.user_id,
            amount: payment.amount,
            status: payment.status,
            created_at,
        })
    }
}

impl SettlementStore for PostgresSettlementStore {
    fn record_settlement(
        &self,
        payment: NewPayment,
    ) -> BoxFuture<'_, Result<Payment, SettlementError>> {
        Box::pin(async move {
            let booking_id = payment.booking_id;
            let status = payment.status;
            let result = self.settle(payment).await;
            match &result {
                Ok(recorded) => tracing::debug!(
                    booking_id = %booking_id,
                    payment_id = %recorded.id,
                    status = status.as_str(),
                    "Settlement recorded"
                ),
                Err(err) => tracing::debug!(booking_id = %booking_id, error = %err, "Settlement not recorded"),
            }
            result
        })
    }
}
