//! Startup and shutdown coordination.

use std::time::Duration;

use crate::error::Result;
use crate::types::Event;

use super::DownloadEngine;

impl DownloadEngine {
    /// Gracefully shut down the engine
    ///
    /// Shutdown sequence:
    /// 1. Stops accepting new dispatches
    /// 2. Stops the queue processor and resume coordinators
    /// 3. Signals cancellation to all active workers
    /// 4. Waits for active workers to finalize their runs (30s timeout)
    /// 5. Emits the shutdown event
    ///
    /// Workers observe cancellation at page/document boundaries, so every
    /// run ends in an explicit terminal state and cursors reflect only
    /// committed pages.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        // 1. Stop accepting new dispatches
        self.pool_state
            .accepting_new
            .store(false, std::sync::atomic::Ordering::SeqCst);

        // 2. Stop the background loops
        self.pool_state.shutdown.cancel();

        // 3. Cancel whatever is still queued or running
        if let Err(e) = self.cancel_all().await {
            tracing::error!(error = %e, "Cancel-all during shutdown failed");
        }

        // 4. Wait for workers to finalize, bounded
        let shutdown_timeout = Duration::from_secs(30);
        match tokio::time::timeout(shutdown_timeout, self.wait_for_active_workers()).await {
            Ok(()) => tracing::info!("All workers finalized"),
            Err(_) => {
                tracing::warn!("Timeout waiting for workers to finalize, proceeding with shutdown")
            }
        }

        // 5. Emit shutdown event
        let _ = self.event_tx.send(Event::Shutdown);

        // Database connections close when the last engine clone is dropped
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Wait until no workers remain in the active map
    async fn wait_for_active_workers(&self) {
        loop {
            let active_count = {
                let active = self.pool_state.active_runs.lock().await;
                active.len()
            };

            if active_count == 0 {
                return;
            }

            tracing::debug!(active_count, "Waiting for active workers to finalize");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
