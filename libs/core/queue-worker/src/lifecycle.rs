//! Startup and graceful shutdown.
//!
//! Shutdown order: stop intake, let in-flight deliveries settle, flush or abandon
//! pending retries, close the transport.

use crate::error::WorkerError;
use crate::registry::{JobHandler, QueueJob};
use crate::transport::QueueTransport;
use crate::worker::QueueWorker;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Idempotent, cloneable shutdown flag with change notification
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    triggered: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
        }
    }

    /// Flip the flag. Returns `true` only for the call that actually initiated shutdown.
    pub fn trigger(&self, reason: &str) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(reason, "Shutdown initiated");
        self.tx.send_replace(true);
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once the flag is set. Never resolves if the sender is gone without setting it.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stopping| *stopping).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Wait for SIGINT or SIGTERM
pub async fn shutdown_signal() {
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
        _ = ctrl_c => {
            info!("Received SIGINT, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}

/// Owns a worker from startup to transport close
pub struct Lifecycle<J, H, T>
where
    J: QueueJob,
    H: JobHandler<J>,
    T: QueueTransport,
{
    worker: QueueWorker<J, H, T>,
}

impl<J, H, T> Lifecycle<J, H, T>
where
    J: QueueJob,
    H: JobHandler<J>,
    T: QueueTransport,
{
    pub fn new(worker: QueueWorker<J, H, T>) -> Self {
        Self { worker }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.worker.shutdown_handle().clone()
    }

    /// Run until `signal` resolves or shutdown is triggered another way.
    ///
    /// Startup failures (declare, prefetch) are returned before anything is consumed.
    pub async fn run<S>(self, signal: S) -> Result<(), WorkerError>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown_handle();

        if let Err(e) = self.worker.start().await {
            error!(error = %e, "Worker startup failed");
            if let Err(close_err) = self.worker.transport().close().await {
                error!(error = %close_err, "Failed to close transport after startup failure");
            }
            return Err(e);
        }

        let signal_handle = shutdown.clone();
        let signal_task = tokio::spawn(async move {
            signal.await;
            signal_handle.trigger("signal received");
        });

        let run_result = self.worker.run().await;

        // The consumer may also stop on its own (closed transport); timers must still see it.
        shutdown.trigger("consumer stopped");
        signal_task.abort();

        self.worker.scheduler().drain().await;

        let close_result = self.worker.transport().close().await;
        if let Err(e) = &close_result {
            error!(error = %e, "Failed to close transport");
        }

        run_result?;
        close_result?;

        info!("Shutdown complete");
        Ok(())
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run_until_signal(self) -> Result<(), WorkerError> {
        self.run(shutdown_signal()).await
    }
}
