//! Background sync scheduler
//!
//! Runs a cycle on every interval tick and whenever the host asks for one.
//! Cycles never overlap and requests arriving mid-cycle collapse into a
//! single follow-up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::engine::SyncEngine;

/// Handle to a running scheduler task
pub struct SyncScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    pub fn spawn(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let period = interval.max(Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {}
                    _ = engine.sync_requested().notified() => {}
                }

                if engine.is_cancelled() {
                    tracing::debug!("Sync suspended, skipping scheduled cycle");
                    continue;
                }

                match engine.run_queued_cycle().await {
                    Ok(report) if !report.is_clean() => {
                        tracing::warn!("Scheduled sync finished with {} errors", report.errors.len());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Scheduled sync failed: {}", e);
                    }
                }
            }

            tracing::debug!("Sync scheduler stopped");
        });

        tracing::info!("Sync scheduler started, interval {:?}", period);
        Self { shutdown, handle }
    }

    /// Stop the scheduler, letting a running cycle finish
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.handle.await {
            tracing::warn!("Sync scheduler task failed: {}", e);
        }
    }
}
