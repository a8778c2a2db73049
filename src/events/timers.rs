use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct TimerHandle {
    generation: u64,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Registry of armed timers keyed by timer id.
///
/// Each armed timer gets a generation number. A timer task may only fire
/// while its generation is still the registered one, and the check and the
/// removal happen under the same lock as cancellation, so a cancelled timer
/// can never fire afterwards.
#[derive(Default)]
pub struct TimerScheduler {
    timers: Mutex<HashMap<String, TimerHandle>>,
    next_generation: AtomicU64,
}

/// What a timer task should do after its wait elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireDecision {
    /// Fire and stay registered for another occurrence.
    FireAndRearm,
    /// Fire; the timer has been removed from the registry.
    FireFinal,
    /// The timer was cancelled or replaced.
    Skip,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TimerHandle>> {
        match self.timers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reserve a slot for `timer_id`, replacing and stopping any previous
    /// timer with the same id. Returns the new generation and its cancel
    /// receiver.
    pub fn arm(&self, timer_id: &str) -> (u64, watch::Receiver<bool>) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel, cancel_rx) = watch::channel(false);

        let previous = self.lock().insert(
            timer_id.to_string(),
            TimerHandle {
                generation,
                cancel,
                task: None,
            },
        );
        if let Some(previous) = previous {
            tracing::debug!(timer_id = %timer_id, "Replacing existing timer");
            let _ = previous.cancel.send(true);
        }

        (generation, cancel_rx)
    }

    /// Attach the spawned task to an armed slot.
    pub fn attach(&self, timer_id: &str, generation: u64, task: JoinHandle<()>) {
        let mut timers = self.lock();
        match timers.get_mut(timer_id) {
            Some(handle) if handle.generation == generation => handle.task = Some(task),
            // already fired, cancelled or replaced
            _ => {}
        }
    }

    /// Decide whether the timer identified by `(timer_id, generation)` may
    /// fire now.
    pub fn claim_fire(&self, timer_id: &str, generation: u64, rearm: bool) -> FireDecision {
        let mut timers = self.lock();
        match timers.get(timer_id) {
            Some(handle) if handle.generation == generation => {
                if rearm {
                    FireDecision::FireAndRearm
                } else {
                    timers.remove(timer_id);
                    FireDecision::FireFinal
                }
            }
            _ => FireDecision::Skip,
        }
    }

    /// Whether `generation` is still the armed registration for `timer_id`.
    pub fn is_current(&self, timer_id: &str, generation: u64) -> bool {
        self.lock()
            .get(timer_id)
            .is_some_and(|handle| handle.generation == generation)
    }

    /// Drop the registration of a finished timer task.
    pub fn release(&self, timer_id: &str, generation: u64) {
        let mut timers = self.lock();
        if timers
            .get(timer_id)
            .is_some_and(|handle| handle.generation == generation)
        {
            timers.remove(timer_id);
        }
    }

    /// Cancel a timer. Returns whether a live timer was found.
    pub fn cancel(&self, timer_id: &str) -> bool {
        match self.lock().remove(timer_id) {
            Some(handle) => {
                let _ = handle.cancel.send(true);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(String, TimerHandle)> = self.lock().drain().collect();
        let count = drained.len();
        for (_, handle) in drained {
            let _ = handle.cancel.send(true);
            if let Some(task) = handle.task {
                task.abort();
            }
        }
        count
    }

    pub fn is_active(&self, timer_id: &str) -> bool {
        self.lock().contains_key(timer_id)
    }

    pub fn active_timer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
