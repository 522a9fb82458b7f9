//! Asynchronous settlement of pending bookings.
//!
//! A confirmed booking is turned into a [`SettlementJob`] and handed to the
//! settlement [`WorkerPool`]. A worker asks a [`SettlementDecider`] for the
//! payment outcome, then records the payment and moves the booking out of
//! `pending` in one transaction.

use crate::config::SettlementConfig;
use crate::metrics;
use futures::future::BoxFuture;
use quicket_core::settlement::{NewPayment, PaymentStatus, SettlementError, SettlementStore};
use quicket_core::types::{BookingId, Money, PublicId, UserId};
use quicket_runtime::{JobHandler, RetryPolicy, WorkerPool, retry_with_predicate};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Pool name used in logs and metrics.
pub const POOL_NAME: &str = "settlement";

/// A booking awaiting its payment outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettlementJob {
    /// Booking to settle.
    pub booking_id: BookingId,
    /// Paying user.
    pub user_id: UserId,
    /// Amount to charge.
    pub amount: Money,
    /// Id for the payment record.
    pub payment_public_id: PublicId,
}

/// Decides the outcome of a settlement.
///
/// Stands in for the payment integration.
pub trait SettlementDecider: Send + Sync {
    /// Settle `job` and report the outcome.
    fn decide<'a>(&'a self, job: &'a SettlementJob) -> BoxFuture<'a, PaymentStatus>;
}

/// Simulated payment integration: waits a random latency, then succeeds with
/// probability `success_ratio`.
#[derive(Clone, Debug)]
pub struct SimulatedSettlement {
    success_ratio: f64,
    max_latency: Duration,
}

impl SimulatedSettlement {
    /// Simulator with the given success probability and latency ceiling.
    ///
    /// `success_ratio` is clamped to `0.0..=1.0`.
    #[must_use]
    pub fn new(success_ratio: f64, max_latency: Duration) -> Self {
        let success_ratio = if success_ratio.is_nan() {
            0.0
        } else {
            success_ratio.clamp(0.0, 1.0)
        };
        Self {
            success_ratio,
            max_latency,
        }
    }

    /// Simulator from configuration.
    #[must_use]
    pub fn from_config(config: &SettlementConfig) -> Self {
        Self::new(config.success_ratio, config.max_latency())
    }
}

impl SettlementDecider for SimulatedSettlement {
    fn decide<'a>(&'a self, job: &'a SettlementJob) -> BoxFuture<'a, PaymentStatus> {
        Box::pin(async move {
            let (latency, succeeded) = {
                let mut rng = rand::thread_rng();
                let max_ms = u64::try_from(self.max_latency.as_millis()).unwrap_or(u64::MAX);
                (
                    Duration::from_millis(rng.gen_range(0..=max_ms)),
                    rng.gen_bool(self.success_ratio),
                )
            };

            tokio::time::sleep(latency).await;

            tracing::debug!(
                booking_id = %job.booking_id,
                latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                succeeded,
                "Simulated settlement decided"
            );

            if succeeded {
                PaymentStatus::Success
            } else {
                PaymentStatus::Failed
            }
        })
    }
}

/// Always settles with the same outcome.
#[derive(Clone, Copy, Debug)]
pub struct FixedSettlement(pub PaymentStatus);

impl SettlementDecider for FixedSettlement {
    fn decide<'a>(&'a self, _job: &'a SettlementJob) -> BoxFuture<'a, PaymentStatus> {
        Box::pin(async move { self.0 })
    }
}

/// Job handler run by each settlement worker.
pub struct SettlementWorker {
    decider: Arc<dyn SettlementDecider>,
    store: Arc<dyn SettlementStore>,
    retry: RetryPolicy,
}

impl SettlementWorker {
    /// Worker recording outcomes from `decider` into `store`.
    ///
    /// Lock contention on the booking row is retried with `retry`.
    #[must_use]
    pub fn new(
        decider: Arc<dyn SettlementDecider>,
        store: Arc<dyn SettlementStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            decider,
            store,
            retry,
        }
    }

    /// Settle one job.
    ///
    /// # Errors
    ///
    /// Returns the [`SettlementError`] left after retries.
    pub async fn settle(&self, job: SettlementJob) -> Result<PaymentStatus, SettlementError> {
        let status = self.decider.decide(&job).await;
        let payment = NewPayment {
            public_id: job.payment_public_id,
            booking_id: job.booking_id,
            user_id: job.user_id,
            amount: job.amount,
            status,
        };

        let recorded = retry_with_predicate(
            &self.retry,
            || self.store.record_settlement(payment.clone()),
            SettlementError::is_transient,
        )
        .await?;

        tracing::info!(
            booking_id = %recorded.booking_id,
            payment_id = %recorded.public_id,
            amount = %recorded.amount,
            status = recorded.status.as_str(),
            "Booking settled"
        );
        Ok(recorded.status)
    }
}

impl JobHandler<SettlementJob> for SettlementWorker {
    fn handle(&self, job: SettlementJob) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let booking_id = job.booking_id;
            match self.settle(job).await {
                Ok(status) => metrics::record_settlement(status.as_str()),
                Err(SettlementError::AlreadySettled { status, .. }) => {
                    metrics::record_settlement("already_settled");
                    tracing::warn!(
                        booking_id = %booking_id,
                        status = status.as_str(),
                        "Booking was already settled, outcome discarded"
                    );
                }
                Err(e) => {
                    metrics::record_settlement("error");
                    tracing::error!(booking_id = %booking_id, error = %e, "Settlement failed");
                }
            }
        })
    }
}

/// Start the settlement pool.
///
/// Must be called within a Tokio runtime.
#[must_use]
pub fn start_pool(config: &SettlementConfig, worker: SettlementWorker) -> WorkerPool<SettlementJob> {
    let handler: Arc<dyn JobHandler<SettlementJob>> = Arc::new(worker);
    WorkerPool::start(POOL_NAME, config.pool_config(), handler)
}
