//! Graceful shutdown coordination.
//!
//! Listens for SIGTERM/SIGINT, broadcasts the shutdown to interested tasks
//! and drives the drain sequence: stop accepting, wait for in-flight requests
//! up to the configured grace, then cancel the remainder.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use eyre::Result;
use tokio::{signal, sync::broadcast};

/// Why the process is going down.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownReason {
    /// SIGTERM / SIGINT.
    Graceful,
    /// Drain grace exceeded or channel lost.
    Force,
}

pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
    grace: Duration,
}

impl GracefulShutdown {
    pub fn new(grace: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            grace,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Trigger shutdown programmatically (tests, admin surface).
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!(?reason, "shutdown triggered");
            let _ = self.shutdown_tx.send(reason);
        }
    }

    /// Block until an OS shutdown signal arrives, then broadcast it.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
        self.trigger_shutdown(ShutdownReason::Graceful);
        Ok(())
    }

    /// Wait indefinitely for the shutdown broadcast.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut receiver = self.subscribe();
        match receiver.recv().await {
            Ok(reason) => reason,
            Err(_) => {
                tracing::warn!("Shutdown channel closed unexpectedly");
                ShutdownReason::Force
            }
        }
    }

    /// Drain in-flight work: polls `active` until it reports zero or the
    /// grace period runs out.
    pub async fn drain<F>(&self, active: F)
    where
        F: Fn() -> u64,
    {
        let deadline = tokio::time::Instant::now() + self.grace;
        loop {
            let remaining = active();
            if remaining == 0 {
                tracing::info!("all in-flight requests drained");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(remaining, "drain grace exceeded, cancelling remainder");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}
