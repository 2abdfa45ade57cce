//! Graceful Shutdown Module
//!
//! Handles graceful shutdown of the proxy: signal handling, broadcast
//! notification to the acceptor, workers, sweeper and stats sampler, and a
//! final stats export before exit.

use crate::stats::StatsLog;
use crate::{ProxyError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    /// Stats log to export on shutdown, with its destination
    stats_export: Option<(Arc<StatsLog>, PathBuf)>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            stats_export: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Register a stats log to be exported to `path` during shutdown
    pub fn set_stats_export(&mut self, stats: Arc<StatsLog>, path: PathBuf) {
        self.stats_export = Some((stats, path));
    }

    /// Get a shutdown receiver for components to listen on
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Block until SIGINT or SIGTERM, then run the shutdown sequence
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::Io(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::Io(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Broadcast the shutdown signal and run teardown under a timeout
    pub async fn initiate_shutdown(&self) -> Result<()> {
        if let Err(e) = self.shutdown_sender.send(()) {
            // Normal if every receiver already exited
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        match timeout(self.shutdown_timeout, self.perform_shutdown()).await {
            Ok(result) => {
                if let Err(e) = &result {
                    error!("Error during graceful shutdown: {}", e);
                }
                result
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?}",
                    self.shutdown_timeout
                );
                Err(ProxyError::Timeout("graceful shutdown".to_string()))
            }
        }
    }

    async fn perform_shutdown(&self) -> Result<()> {
        if let Some((stats, path)) = &self.stats_export {
            info!("Writing final cache statistics to {}", path.display());
            if let Err(e) = stats.write_csv(path) {
                warn!("Failed to export cache statistics: {}", e);
            }
        }

        // Give in-flight responses a moment to drain
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!("Shutdown operations completed");
        Ok(())
    }
}

/// Shutdown signal wrapper handed to components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    /// Check whether shutdown has been observed (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for the shutdown broadcast. A closed or lagged channel counts as
    /// shutdown.
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        match self.receiver.recv().await {
            Ok(())
            | Err(broadcast::error::RecvError::Closed)
            | Err(broadcast::error::RecvError::Lagged(_)) => {
                self.shutdown_requested = true;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_observe_shutdown() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut signal = ShutdownSignal::new(coordinator.subscribe());
        assert!(!signal.is_shutdown_requested());

        coordinator.initiate_shutdown().await.unwrap();

        signal.wait_for_shutdown().await.unwrap();
        assert!(signal.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_closed_channel_counts_as_shutdown() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut signal = ShutdownSignal::new(coordinator.subscribe());
        drop(coordinator);

        signal.wait_for_shutdown().await.unwrap();
        assert!(signal.is_shutdown_requested());
    }
}
