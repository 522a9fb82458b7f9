//! # Quicket Runtime
//!
//! Execution primitives shared by the booking service:
//!
//! - [`retry`]: exponential backoff for transient failures such as no-wait
//!   lock contention
//! - [`worker_pool`]: a fixed set of workers draining one bounded queue, with
//!   non-blocking submission, panic isolation and per-job deadlines
//! - [`metrics`]: Prometheus exporter

pub mod metrics;
pub mod retry;
pub mod worker_pool;

pub use retry::{RetryPolicy, RetryPolicyBuilder, retry_with_predicate};
pub use worker_pool::{JobHandler, SubmitError, WorkerPool, WorkerPoolConfig, panic_message};
