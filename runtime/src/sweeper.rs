//! Periodic retry of queues whose replay stopped early.
//!
//! A replay that halts (publish rejected, broker down) leaves the rest of the
//! queue in place. Nothing else would ever touch it again unless a new
//! creation delivery arrived, so the sweeper walks the backlog on an interval.

use crate::orchestrator::FailSafeOrchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Background task calling [`FailSafeOrchestrator::sweep`].
pub struct ReplaySweeper {
    orchestrator: Arc<FailSafeOrchestrator>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl ReplaySweeper {
    /// Create a sweeper running every `interval`.
    #[must_use]
    pub const fn new(
        orchestrator: Arc<FailSafeOrchestrator>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            orchestrator,
            interval,
            shutdown,
        }
    }

    /// Spawn the sweeper as a background task.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            "Replay sweeper started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!("Replay sweeper received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    match self.orchestrator.sweep().await {
                        Ok(report) if report.requests > 0 => {
                            info!(
                                requests = report.requests,
                                replayed = report.replayed,
                                halted = report.halted,
                                "Sweep replayed leftover queues"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
            }
        }
        info!("Replay sweeper stopped");
    }
}
