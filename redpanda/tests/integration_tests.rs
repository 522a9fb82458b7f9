//! Integration tests for [`RedpandaChangeBus`] with a real Kafka instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Publish/subscribe round-trip with routing metadata
//! - Binding filters
//! - Requeue redelivers with an incremented count
//! - Reject moves the message to the dead-letter topic
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p quicket-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use futures::StreamExt;
use quicket_core::change::ChangeMessage;
use quicket_core::change_bus::{ChangeBus, Delivery, DeliveryStream, Subscription};
use quicket_redpanda::RedpandaChangeBus;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

fn message(routing_key: &str, key: &str) -> ChangeMessage {
    ChangeMessage::json(routing_key, key, &serde_json::json!({ "id": key })).expect("encode")
}

/// Start Kafka and return a bus once it accepts publishes.
async fn start_bus() -> (ContainerAsync<Kafka>, RedpandaChangeBus) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");
    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");

    let bus = RedpandaChangeBus::builder()
        .brokers(&brokers)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create change bus");

    for _ in 0..60 {
        if bus.publish("warmup", &message("warmup", "0")).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return (kafka, bus);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("Kafka failed to become ready after 60 attempts")
}

async fn next_delivery(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(20), stream.next())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Stream ended")
        .expect("Delivery error")
}

#[tokio::test]
#[ignore]
async fn test_publish_and_ack_round_trip() {
    let (_kafka, bus) = start_bus().await;
    let subscription = Subscription::new("events", "booking-events").bind("event.#");
    let mut stream = bus.subscribe(&subscription).await.expect("subscribe");

    let sent = message("event.seats.updated", "42");
    bus.publish("events", &sent).await.expect("publish");

    let delivery = next_delivery(&mut stream).await;
    assert_eq!(delivery.message, sent);
    delivery.ack().await.expect("ack");
}

#[tokio::test]
#[ignore]
async fn test_unbound_routing_keys_are_skipped() {
    let (_kafka, bus) = start_bus().await;
    let subscription = Subscription::new("mixed", "booking-events").bind("event.*");
    let mut stream = bus.subscribe(&subscription).await.expect("subscribe");

    bus.publish("mixed", &message("user.created", "1")).await.expect("publish");
    bus.publish("mixed", &message("event.created", "2")).await.expect("publish");

    let delivery = next_delivery(&mut stream).await;
    assert_eq!(delivery.message.routing_key, "event.created");
    delivery.ack().await.expect("ack");
}

#[tokio::test]
#[ignore]
async fn test_requeue_redelivers_with_count() {
    let (_kafka, bus) = start_bus().await;
    let subscription = Subscription::new("requeue", "booking-events");
    let mut stream = bus.subscribe(&subscription).await.expect("subscribe");

    let sent = message("event.updated", "5");
    bus.publish("requeue", &sent).await.expect("publish");

    let first = next_delivery(&mut stream).await;
    assert_eq!(first.message.redeliveries, 0);
    first.requeue().await.expect("requeue");

    let second = next_delivery(&mut stream).await;
    assert_eq!(second.message.message_id, sent.message_id);
    assert_eq!(second.message.redeliveries, 1);
    second.ack().await.expect("ack");
}

#[tokio::test]
#[ignore]
async fn test_reject_moves_message_to_dead_letter_topic() {
    let (_kafka, bus) = start_bus().await;
    let subscription = Subscription::new("rejects", "booking-events").dead_letter("rejects.dlq");
    let mut stream = bus.subscribe(&subscription).await.expect("subscribe");
    let mut dead_letters = bus
        .subscribe(&Subscription::new("rejects.dlq", "dlq-inspector"))
        .await
        .expect("subscribe to dead letters");

    let sent = message("event.created", "9");
    bus.publish("rejects", &sent).await.expect("publish");

    let delivery = next_delivery(&mut stream).await;
    delivery.reject("Malformed payload").await.expect("reject");

    let dead = next_delivery(&mut dead_letters).await;
    assert_eq!(dead.message.message_id, sent.message_id);
    assert_eq!(dead.message.body, sent.body);
    dead.ack().await.expect("ack");
}
