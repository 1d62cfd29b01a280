//! Idle reaper — background task sweeping idle connections on a fixed interval.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::pool::ConnectionPool;

/// Spawns the sweep loop for a [`ConnectionPool`].
pub struct IdleReaper;

impl IdleReaper {
    /// Start sweeping `pool` every `interval`. The first sweep runs one
    /// interval after start.
    pub fn spawn(pool: ConnectionPool, interval: Duration) -> IdleReaperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_reaper_loop(pool, interval, shutdown_rx));
        info!(interval = ?interval, "idle reaper started");
        IdleReaperHandle {
            shutdown_tx,
            handle,
        }
    }
}

/// Running reaper. Dropping it also ends the loop at its next wakeup.
pub struct IdleReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl IdleReaperHandle {
    /// Signal the loop and wait for it to exit. A sweep already in progress
    /// finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "idle reaper task ended abnormally");
        }
        info!("idle reaper stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl std::fmt::Debug for IdleReaperHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleReaperHandle")
            .field("finished", &self.handle.is_finished())
            .finish_non_exhaustive()
    }
}

async fn run_reaper_loop(pool: ConnectionPool, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reaped = pool.sweep_idle().await;
                debug!(reaped = reaped.len(), "idle sweep complete");
            }
            _ = shutdown.changed() => {
                debug!("idle reaper shutting down");
                break;
            }
        }
    }
}
