use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::{OrchestrationError, OrchestrationResult};
use crate::shutdown::wait_for_cancel;

/// How a wait point resolved
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Signalled(serde_json::Value),
    DeadlineElapsed,
    Cancelled,
}

/// Block until the first of: a signal on `signals`, the deadline, or
/// cancellation.
///
/// Cancellation and the deadline are checked before the signal channel, so
/// a signal that arrives once the deadline has passed loses the race.
pub async fn wait_point(
    signals: &mut mpsc::Receiver<serde_json::Value>,
    deadline: Instant,
    cancel: &mut watch::Receiver<bool>,
) -> WaitOutcome {
    tokio::select! {
        biased;
        _ = wait_for_cancel(cancel) => WaitOutcome::Cancelled,
        _ = tokio::time::sleep_until(deadline) => WaitOutcome::DeadlineElapsed,
        received = signals.recv() => match received {
            Some(payload) => WaitOutcome::Signalled(payload),
            None => WaitOutcome::Cancelled,
        },
    }
}

/// Held by a run until it has recorded its final status.
///
/// Dropping it lets [`RunRegistry::wait_idle`] make progress.
#[must_use = "the run counts as live only while this is held"]
pub struct LiveRun {
    live: Arc<watch::Sender<usize>>,
}

impl Drop for LiveRun {
    fn drop(&mut self) {
        self.live.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Cancellation handles of in-flight runs keyed by run id, plus a count of
/// runs that have not finished yet.
///
/// A cancelled run leaves the handle map at once but stays live until its
/// [`LiveRun`] is dropped.
pub struct RunRegistry {
    runs: Mutex<HashMap<String, watch::Sender<bool>>>,
    live: Arc<watch::Sender<usize>>,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            live: Arc::new(watch::Sender::new(0)),
        }
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Sender<bool>>> {
        match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(
        &self,
        run_id: &str,
    ) -> OrchestrationResult<(watch::Receiver<bool>, LiveRun)> {
        let mut runs = self.lock();
        if runs.contains_key(run_id) {
            return Err(OrchestrationError::conflict(format!(
                "run {} is already in flight",
                run_id
            )));
        }
        let (tx, rx) = watch::channel(false);
        runs.insert(run_id.to_string(), tx);
        self.live.send_modify(|n| *n += 1);
        Ok((
            rx,
            LiveRun {
                live: self.live.clone(),
            },
        ))
    }

    pub fn unregister(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    /// Ask a run to stop at its wait point. Returns whether it was found.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.lock().remove(run_id) {
            Some(tx) => {
                let _ = tx.send(true);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<watch::Sender<bool>> = self.lock().drain().map(|(_, tx)| tx).collect();
        for tx in &drained {
            let _ = tx.send(true);
        }
        drained.len()
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.lock().contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs registered and not yet finished, cancelled ones included.
    pub fn live_count(&self) -> usize {
        *self.live.borrow()
    }

    /// Resolve once every registered run has dropped its [`LiveRun`].
    pub async fn wait_idle(&self) {
        let mut rx = self.live.subscribe();
        // The sender lives in `self`, so this only errors if it is gone.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_signal_wins_before_deadline() {
        let (tx, mut rx) = mpsc::channel(1);
        let (_cancel_tx, mut cancel) = watch::channel(false);
        tx.send(json!({"done": true})).await.unwrap();

        let outcome = wait_point(&mut rx, Instant::now() + Duration::from_secs(5), &mut cancel).await;
        assert_eq!(outcome, WaitOutcome::Signalled(json!({"done": true})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapses() {
        let (_tx, mut rx) = mpsc::channel::<serde_json::Value>(1);
        let (_cancel_tx, mut cancel) = watch::channel(false);
        let start = Instant::now();

        let outcome = wait_point(&mut rx, start + Duration::from_secs(60), &mut cancel).await;
        assert_eq!(outcome, WaitOutcome::DeadlineElapsed);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unblocks_wait() {
        let registry = RunRegistry::new();
        let (mut cancel, _live) = registry.register("pi-1").unwrap();
        let (_tx, mut rx) = mpsc::channel::<serde_json::Value>(1);

        let waiter = tokio::spawn(async move {
            wait_point(&mut rx, Instant::now() + Duration::from_secs(3600), &mut cancel).await
        });
        tokio::task::yield_now().await;
        assert!(registry.cancel("pi-1"));

        assert_eq!(waiter.await.unwrap(), WaitOutcome::Cancelled);
        assert!(!registry.is_running("pi-1"));
    }

    #[test]
    fn test_duplicate_run_conflicts() {
        let registry = RunRegistry::new();
        let (_rx, live) = registry.register("pi-1").unwrap();
        assert!(registry.register("pi-1").is_err());
        assert_eq!(registry.cancel_all(), 1);
        assert!(registry.is_empty());

        assert_eq!(registry.live_count(), 1);
        drop(live);
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_outlasts_cancellation() {
        let registry = Arc::new(RunRegistry::new());
        let (mut cancel, live) = registry.register("pi-1").unwrap();
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let run_finished = finished.clone();
        tokio::spawn(async move {
            wait_for_cancel(&mut cancel).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            run_finished.store(true, std::sync::atomic::Ordering::SeqCst);
            drop(live);
        });
        tokio::task::yield_now().await;

        registry.cancel_all();
        registry.wait_idle().await;
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
    }
}
