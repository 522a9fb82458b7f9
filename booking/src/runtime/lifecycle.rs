//! Process lifecycle: start the consumers, wait for a stop signal, drain.
//!
//! 1. **Startup**: spawn every change consumer
//! 2. **Runtime**: consumers drain their queues, the settlement pool settles bookings
//! 3. **Shutdown**: on Ctrl+C or SIGTERM, broadcast shutdown to the consumers,
//!    then drain the settlement pool, all within the shutdown timeout

use super::ChangeConsumer;
use crate::settlement::SettlementJob;
use quicket_runtime::WorkerPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Snapshot consumers and the settlement pool, owned until shutdown.
pub struct Application {
    /// Snapshot consumers
    consumers: Vec<ChangeConsumer>,

    /// Settlement worker pool, shared with the booking service
    settlement: Arc<WorkerPool<SettlementJob>>,

    /// Tells every consumer to stop
    shutdown_tx: broadcast::Sender<()>,

    /// Budget for the whole shutdown sequence
    shutdown_timeout: Duration,
}

impl Application {
    /// Application over already-built consumers and pool.
    #[must_use]
    pub fn new(
        consumers: Vec<ChangeConsumer>,
        settlement: Arc<WorkerPool<SettlementJob>>,
        shutdown_tx: broadcast::Sender<()>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            consumers,
            settlement,
            shutdown_tx,
            shutdown_timeout,
        }
    }

    /// Run until the process receives Ctrl+C or SIGTERM.
    pub async fn run(self) {
        self.run_until(shutdown_signal()).await;
    }

    /// Run until `signal` completes, then shut down gracefully.
    ///
    /// Returns `true` if every task stopped within the shutdown timeout.
    pub async fn run_until(self, signal: impl Future<Output = ()>) -> bool {
        info!(consumer_count = self.consumers.len(), "Starting change consumers");
        let handles: Vec<(String, JoinHandle<()>)> = self
            .consumers
            .into_iter()
            .map(|consumer| (consumer.name().to_string(), consumer.spawn()))
            .collect();

        signal.await;
        info!("Initiating graceful shutdown...");

        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut clean = true;

        for (name, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => info!(consumer = %name, "Consumer stopped gracefully"),
                Ok(Err(e)) => {
                    clean = false;
                    error!(consumer = %name, error = %e, "Consumer task failed");
                }
                Err(_) => {
                    clean = false;
                    warn!(consumer = %name, "Consumer shutdown timed out");
                }
            }
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if !self.settlement.shutdown(remaining).await {
            clean = false;
        }

        if clean {
            info!("Shutdown complete, all tasks drained");
        } else {
            warn!("Shutdown finished with tasks still running");
        }
        clean
    }
}

/// Resolves on the first Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
