//! Background monitor for the resource manager.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ResourceManager;

/// Handle to a running monitor, used for shutdown.
pub struct MonitorHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signal the monitor to stop after its current tick.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "Resource monitor task failed");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn a loop that calls [`ResourceManager::sample_and_adjust`] every
/// `interval` until the returned handle is stopped or dropped.
pub fn start_monitoring(manager: ResourceManager, interval: Duration) -> MonitorHandle {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    debug!(?interval, "Starting resource monitor");

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_clone.cancelled() => {
                    debug!("Resource monitor cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    manager.sample_and_adjust().await;
                }
            }
        }
    });

    MonitorHandle {
        cancel,
        join: Some(join),
    }
}
