//! Quicket booking service: seat reservations that never oversell.
//!
//! The service takes seat bookings against a relational ledger, keeps local
//! snapshots of events and users fresh from a change stream, and settles
//! payments in a bounded background pool.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!   create ───────▶│  BookingService  │──── snapshot lookups ────┐
//!                  └──────────────────┘                          │
//!                     │            │                              ▼
//!        FOR UPDATE NOWAIT     submit (non-blocking)    ┌──────────────────┐
//!                     ▼            ▼                    │ Event / User     │
//!              ┌───────────┐  ┌──────────────┐          │ snapshot stores  │
//!              │ SeatLedger│  │ Settlement   │          └──────────────────┘
//!              └───────────┘  │ worker pool  │                   ▲
//!                     │       └──────────────┘                   │
//!          event.seats.updated                          ┌──────────────────┐
//!                     ▼                                 │  ChangeConsumer  │
//!              ┌─────────────────┐     events / users   │  (per topic)     │
//!              │ ChangePublisher │────────────────────▶ └──────────────────┘
//!              └─────────────────┘       (Redpanda)
//! ```
//!
//! # Key Features
//!
//! ## 1. No oversell
//!
//! A booking locks its event row with `FOR UPDATE NOWAIT`, checks the seat
//! count, inserts the booking and decrements seats in one transaction. A held
//! lock surfaces immediately as contention and is retried with backoff.
//!
//! ## 2. Versioned snapshots
//!
//! Every change carries the ledger version it was produced at. Snapshot
//! writes only land when the incoming version is not older than the stored
//! one, so out-of-order and duplicate deliveries converge.
//!
//! ## 3. Bounded settlement
//!
//! Settlement jobs are queued without blocking the caller. A full queue
//! leaves the booking pending instead of delaying the response.
//!
//! # Modules
//!
//! - **`service`**: the booking use case
//! - **`catalog`**: event registration, revision and removal
//! - **`publisher`**: change publication
//! - **`settlement`**: settlement jobs, deciders and the worker
//! - **`runtime`**: snapshot consumers and the application lifecycle
//! - **`bootstrap`**: wiring to `PostgreSQL` and Redpanda
//! - **`config`**, **`error`**, **`metrics`**

pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod error;
pub mod metrics;
pub mod publisher;
pub mod runtime;
pub mod service;
pub mod settlement;

pub use bootstrap::{Backends, Components, assemble, build};
pub use catalog::EventCatalog;
pub use config::Config;
pub use error::{BookingError, BootstrapError, ErrorKind, PublishError};
pub use publisher::ChangePublisher;
pub use service::{BookingService, BookingView};
pub use settlement::{
    FixedSettlement, SettlementDecider, SettlementJob, SettlementWorker, SimulatedSettlement,
};
