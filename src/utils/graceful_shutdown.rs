use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use eyre::Result;
use tokio::{signal, sync::broadcast};

/// Represents different shutdown reasons
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// Graceful shutdown requested (SIGTERM, SIGINT)
    Graceful,
    /// Forced shutdown (repeated signal, or the shutdown channel was lost)
    Force,
}

/// Manages graceful shutdown signalling for the serving process
pub struct GracefulShutdown {
    /// Broadcast sender for shutdown signals
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    /// Flag indicating if shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a receiver for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Manually trigger shutdown
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> Result<()> {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("Shutdown manually triggered: {:?}", reason);
            let _ = self.shutdown_tx.send(reason);
        }
        Ok(())
    }

    /// Start listening for OS signals and manage shutdown process.
    ///
    /// The first SIGINT/SIGTERM broadcasts a graceful shutdown; a second
    /// one broadcasts `Force` for subscribers that want to stop waiting
    /// on the drain.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        self.next_signal().await;
        tracing::info!("Received shutdown signal, initiating graceful shutdown...");
        self.initiate_shutdown(ShutdownReason::Graceful);

        self.next_signal().await;
        tracing::warn!("Received second shutdown signal, broadcasting forced shutdown");
        let _ = self.shutdown_tx.send(ShutdownReason::Force);

        tracing::info!("Signal handler shutting down");
        Ok(())
    }

    async fn next_signal(&self) {
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = self.wait_for_sigterm() => {}
        }
    }

    #[cfg(unix)]
    async fn wait_for_sigterm(&self) {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
        sigterm.recv().await;
    }

    #[cfg(not(unix))]
    async fn wait_for_sigterm(&self) {
        // On non-Unix systems, we only have Ctrl+C
        std::future::pending::<()>().await;
    }

    fn initiate_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("Processing shutdown signal: {:?}", reason);
            if let Err(e) = self.shutdown_tx.send(reason) {
                tracing::error!("Failed to send shutdown signal: {}", e);
            }
        } else {
            tracing::warn!("Shutdown already initiated, ignoring signal");
        }
    }

    /// Wait indefinitely for a shutdown signal (used in the main loop)
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut receiver = self.subscribe();

        match receiver.recv().await {
            Ok(reason) => {
                tracing::info!("Shutdown signal received: {:?}", reason);
                reason
            }
            Err(_) => {
                tracing::warn!("Shutdown channel closed unexpectedly");
                ShutdownReason::Force
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_graceful_shutdown_creation() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
    }

    #[tokio::test]
    async fn test_manual_trigger_shutdown() {
        let shutdown = GracefulShutdown::new();
        let mut receiver = shutdown.subscribe();

        shutdown.trigger_shutdown(ShutdownReason::Graceful).unwrap();
        assert!(shutdown.is_shutdown_initiated());

        let reason = receiver.try_recv().unwrap();
        assert!(matches!(reason, ShutdownReason::Graceful));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let shutdown = GracefulShutdown::new();
        let mut receiver1 = shutdown.subscribe();
        let mut receiver2 = shutdown.subscribe();

        shutdown.trigger_shutdown(ShutdownReason::Graceful).unwrap();

        assert!(matches!(
            receiver1.try_recv().unwrap(),
            ShutdownReason::Graceful
        ));
        assert!(matches!(
            receiver2.try_recv().unwrap(),
            ShutdownReason::Graceful
        ));
    }
}
