//! Business metrics for the booking service.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `quicket_bookings_total{outcome}` - Booking attempts by outcome
//! - `quicket_booked_seats_total` - Seats taken by committed bookings
//! - `quicket_settlement_jobs_total{outcome}` - Settlement jobs by outcome
//! - `quicket_snapshot_messages_total{consumer, outcome}` - Change messages by consumer and outcome
//! - `quicket_changes_published_total{routing_key}` - Published changes
//! - `quicket_change_publish_failures_total{routing_key}` - Changes lost to publish failures
//!
//! ## Histograms
//! - `quicket_booking_duration_seconds` - End-to-end `create` latency

use metrics::{describe_counter, describe_histogram};

/// Initialize and register all business metrics descriptions.
///
/// This should be called once at application startup, before any metrics are recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "quicket_bookings_total",
        "Booking attempts by outcome (created, seats_unavailable, event_expired, lock_contention, ...)"
    );
    describe_counter!(
        "quicket_booked_seats_total",
        "Seats taken by committed bookings"
    );
    describe_histogram!(
        "quicket_booking_duration_seconds",
        "Time taken by BookingService::create, including retries"
    );

    describe_counter!(
        "quicket_settlement_jobs_total",
        "Settlement jobs by outcome (submitted, rejected, success, failed, already_settled, error)"
    );

    describe_counter!(
        "quicket_snapshot_messages_total",
        "Change messages by consumer and outcome (applied, skipped, ignored, requeued, dead_lettered)"
    );

    describe_counter!(
        "quicket_changes_published_total",
        "Changes published by routing key"
    );
    describe_counter!(
        "quicket_change_publish_failures_total",
        "Changes that could not be published, by routing key"
    );

    tracing::info!("Business metrics registered");
}

/// Record a booking attempt.
pub fn record_booking(outcome: &'static str, seats: u32, duration_secs: f64) {
    metrics::counter!("quicket_bookings_total", "outcome" => outcome).increment(1);
    metrics::histogram!("quicket_booking_duration_seconds").record(duration_secs);
    if outcome == "created" {
        metrics::counter!("quicket_booked_seats_total").increment(u64::from(seats));
    }
}

/// Record a settlement job transition.
pub fn record_settlement(outcome: &'static str) {
    metrics::counter!("quicket_settlement_jobs_total", "outcome" => outcome).increment(1);
}

/// Record a consumed change message.
pub fn record_snapshot_message(consumer: &str, outcome: &'static str) {
    metrics::counter!(
        "quicket_snapshot_messages_total",
        "consumer" => consumer.to_owned(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a published change.
pub fn record_change_published(routing_key: &'static str) {
    metrics::counter!("quicket_changes_published_total", "routing_key" => routing_key).increment(1);
}

/// Record a change lost to a publish failure.
pub fn record_change_publish_failed(routing_key: &'static str) {
    metrics::counter!("quicket_change_publish_failures_total", "routing_key" => routing_key)
        .increment(1);
}
