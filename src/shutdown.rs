use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::events::EventCoordinator;
use crate::observability::orchestration_metrics;
use crate::orchestration::RunRegistry;

/// Resolve once `rx` carries `true`.
///
/// A dropped sender without a prior cancel never resolves.
pub async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            if *rx.borrow() {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}

/// Graceful shutdown coordinator for the orchestrator
pub struct ShutdownCoordinator {
    runs: Arc<RunRegistry>,
    events: EventCoordinator,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(runs: Arc<RunRegistry>, events: EventCoordinator) -> Self {
        Self {
            runs,
            events,
            drain_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Cancel waiting runs and armed timers, then wait (bounded by the drain
    /// timeout) until every run has recorded its final status.
    pub async fn shutdown_all_services(&self) -> Result<()> {
        info!("Initiating graceful shutdown of all services...");

        let timers = self.events.shutdown();
        let runs = self.runs.cancel_all();
        info!(timers, runs, "Cancelled timers and in-flight runs");

        if let Err(e) = self.wait_for_runs_to_drain().await {
            warn!("Some runs may not have finished cleanly: {}", e);
        }

        orchestration_metrics().log_stats();
        info!("Graceful shutdown completed successfully");
        Ok(())
    }

    async fn wait_for_runs_to_drain(&self) -> Result<()> {
        timeout(self.drain_timeout, self.runs.wait_idle())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Timeout waiting for runs to drain ({} still live)",
                    self.runs.live_count()
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheTtls, MokaCache};
    use crate::events::TimerEvent;
    use crate::store::InMemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_runs_and_timers() {
        let runs = Arc::new(RunRegistry::new());
        let events = EventCoordinator::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(MokaCache::default()),
            CacheTtls::default(),
        );
        let (mut cancel, live) = runs.register("pi-1").unwrap();
        events
            .schedule_timer(TimerEvent::new(
                "t1",
                "pi-1",
                chrono::Utc::now() + chrono::Duration::hours(1),
            ))
            .await
            .unwrap();

        let run = tokio::spawn(async move {
            wait_for_cancel(&mut cancel).await;
            drop(live);
        });

        let coordinator = ShutdownCoordinator::new(runs.clone(), events.clone());
        coordinator.shutdown_all_services().await.unwrap();

        assert!(runs.is_empty());
        assert_eq!(runs.live_count(), 0);
        assert!(events.active_timers().is_empty());
        run.await.unwrap();
    }
}
