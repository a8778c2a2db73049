use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Orchestration counters
#[derive(Debug, Default)]
pub struct OrchestrationMetrics {
    pub events_published: AtomicU64,
    pub listener_failures: AtomicU64,
    pub timers_scheduled: AtomicU64,
    pub timers_fired: AtomicU64,
    pub timers_cancelled: AtomicU64,
    pub runs_started: AtomicU64,
    pub runs_timed_out: AtomicU64,
    pub approvals_completed: AtomicU64,
    pub notification_failures: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

impl OrchestrationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_failure(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timer_scheduled(&self) {
        self.timers_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timer_fired(&self) {
        self.timers_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timer_cancelled(&self) {
        self.timers_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_timeout(&self) {
        self.runs_timed_out.fetch_add(1, Ordering::Relaxed);
        warn!("Orchestration run reached its deadline");
    }

    pub fn record_approval_completed(&self) {
        self.approvals_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification_failure(&self) {
        self.notification_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> OrchestrationStats {
        OrchestrationStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
            timers_scheduled: self.timers_scheduled.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            timers_cancelled: self.timers_cancelled.load(Ordering::Relaxed),
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_timed_out: self.runs_timed_out.load(Ordering::Relaxed),
            approvals_completed: self.approvals_completed.load(Ordering::Relaxed),
            notification_failures: self.notification_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            events_published = stats.events_published,
            listener_failures = stats.listener_failures,
            timers_fired = stats.timers_fired,
            timers_cancelled = stats.timers_cancelled,
            runs_started = stats.runs_started,
            runs_timed_out = stats.runs_timed_out,
            approvals_completed = stats.approvals_completed,
            cache_hits = stats.cache_hits,
            cache_misses = stats.cache_misses,
            "Orchestration metrics"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationStats {
    pub events_published: u64,
    pub listener_failures: u64,
    pub timers_scheduled: u64,
    pub timers_fired: u64,
    pub timers_cancelled: u64,
    pub runs_started: u64,
    pub runs_timed_out: u64,
    pub approvals_completed: u64,
    pub notification_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Global metrics instance
static ORCHESTRATION_METRICS: std::sync::LazyLock<OrchestrationMetrics> =
    std::sync::LazyLock::new(OrchestrationMetrics::new);

pub fn orchestration_metrics() -> &'static OrchestrationMetrics {
    &ORCHESTRATION_METRICS
}

/// Time an operation and log its duration when dropped
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        // logging happens in Drop
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
    }
}

#[macro_export]
macro_rules! time_operation {
    ($operation:expr) => {
        let _timer = $crate::observability::OperationTimer::new($operation);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = OrchestrationMetrics::new();
        metrics.record_event_published();
        metrics.record_event_published();
        metrics.record_listener_failure();
        metrics.record_cache_miss();

        let stats = metrics.get_stats();
        assert_eq!(stats.events_published, 2);
        assert_eq!(stats.listener_failures, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.timers_fired, 0);
    }
}
