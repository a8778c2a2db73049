use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::listeners::{EventListener, ListenerRegistry};
use super::repeat::RepeatRule;
use super::timers::{FireDecision, TimerScheduler};
use super::types::*;
use crate::cache::{self, CacheRepository, CacheTtls};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::observability::orchestration_metrics;
use crate::shutdown::wait_for_cancel;
use crate::store::ProcessEventRepository;
use crate::variables;

/// Resolves the single waiting instance a message is addressed to.
pub trait MessageCorrelator: Send + Sync {
    fn correlate(&self, message_name: &str, keys: &HashMap<String, String>) -> Option<String>;
}

struct CoordinatorInner {
    events: Arc<dyn ProcessEventRepository>,
    cache: Arc<dyn CacheRepository>,
    ttls: CacheTtls,
    listeners: ListenerRegistry,
    timers: TimerScheduler,
    correlator: RwLock<Option<Arc<dyn MessageCorrelator>>>,
    /// Bumped after every append, before the listing cache is invalidated.
    publishes: AtomicU64,
}

/// Publishes process events, fans them out to listeners and runs timers.
///
/// Cloning is cheap; clones share listeners and timers.
#[derive(Clone)]
pub struct EventCoordinator {
    inner: Arc<CoordinatorInner>,
}

fn event_id(prefix: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, nanos, &suffix[..8])
}

impl EventCoordinator {
    pub fn new(
        events: Arc<dyn ProcessEventRepository>,
        cache: Arc<dyn CacheRepository>,
        ttls: CacheTtls,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                events,
                cache,
                ttls,
                listeners: ListenerRegistry::new(),
                timers: TimerScheduler::new(),
                correlator: RwLock::new(None),
                publishes: AtomicU64::new(0),
            }),
        }
    }

    pub fn register_listener(&self, event_type: &str, listener: Arc<dyn EventListener>) {
        self.inner.listeners.register(event_type, listener);
    }

    pub fn set_correlator(&self, correlator: Arc<dyn MessageCorrelator>) {
        let mut slot = match self.inner.correlator.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(correlator);
    }

    fn correlator(&self) -> Option<Arc<dyn MessageCorrelator>> {
        match self.inner.correlator.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Persist an event and notify listeners without waiting for them.
    pub async fn publish_event(&self, event: ProcessEvent) -> OrchestrationResult<ProcessEvent> {
        self.publish_and_dispatch(event).await.map(|(event, _)| event)
    }

    /// Like [`publish_event`](Self::publish_event) but hands back the
    /// listener tasks so callers can wait for fan-out to settle.
    pub async fn publish_and_dispatch(
        &self,
        mut event: ProcessEvent,
    ) -> OrchestrationResult<(ProcessEvent, Vec<JoinHandle<()>>)> {
        if event.event_type.is_empty() {
            return Err(OrchestrationError::validation("event type must not be empty"));
        }
        if event.process_instance_id.is_empty() {
            return Err(OrchestrationError::validation(
                "process instance id must not be empty",
            ));
        }
        if event.id.is_empty() {
            event.id = event_id("event");
        }
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }

        self.inner.events.append_event(&event).await?;
        self.inner.publishes.fetch_add(1, Ordering::SeqCst);

        let cache = self.inner.cache.as_ref();
        cache::set_json(
            cache,
            &cache::process_event_key(&event.id),
            &event,
            self.inner.ttls.process_event,
        )
        .await;
        cache::invalidate(cache, &cache::process_events_key(&event.process_instance_id)).await;

        orchestration_metrics().record_event_published();
        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            process_instance_id = %event.process_instance_id,
            "Published process event"
        );

        let handles = self.inner.listeners.dispatch(&event);
        Ok((event, handles))
    }

    pub async fn send_signal(&self, signal: SignalEvent) -> OrchestrationResult<ProcessEvent> {
        if signal.signal_name.is_empty() {
            return Err(OrchestrationError::validation("signal name must not be empty"));
        }

        let target = signal
            .process_instance_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| BROADCAST_INSTANCE.to_string());

        let mut event = ProcessEvent::new(EVENT_SIGNAL, signal.signal_name.clone(), target)
            .with_payload(variables::to_json_object(&signal.variables));
        event.id = event_id(&format!("signal_{}", signal.signal_name));
        event.tenant_id = signal.tenant_id;

        info!(signal = %signal.signal_name, target = %event.process_instance_id, "Sending signal");
        self.publish_event(event).await
    }

    pub async fn send_message(&self, message: MessageEvent) -> OrchestrationResult<ProcessEvent> {
        if message.message_name.is_empty() {
            return Err(OrchestrationError::validation("message name must not be empty"));
        }

        let target = match message.process_instance_id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => {
                if message.correlation_keys.is_empty() {
                    return Err(OrchestrationError::validation(
                        "message needs a target instance or correlation keys",
                    ));
                }
                self.correlator()
                    .and_then(|c| c.correlate(&message.message_name, &message.correlation_keys))
                    .ok_or_else(|| {
                        OrchestrationError::not_found(
                            "message subscription",
                            message.message_name.clone(),
                        )
                    })?
            }
        };

        let mut payload = variables::to_json_object(&message.variables);
        if !message.correlation_keys.is_empty() {
            payload.insert(
                "correlation_keys".to_string(),
                serde_json::to_value(&message.correlation_keys)
                    .map_err(|e| OrchestrationError::validation(e.to_string()))?,
            );
        }

        let mut event = ProcessEvent::new(EVENT_MESSAGE, message.message_name.clone(), target)
            .with_payload(payload);
        event.id = event_id(&format!("message_{}", message.message_name));
        event.tenant_id = message.tenant_id;

        self.publish_event(event).await
    }

    /// Arm a timer. Rescheduling an existing id replaces the old timer.
    pub async fn schedule_timer(&self, timer: TimerEvent) -> OrchestrationResult<()> {
        if timer.timer_id.is_empty() {
            return Err(OrchestrationError::validation("timer id must not be empty"));
        }
        if timer.process_instance_id.is_empty() {
            return Err(OrchestrationError::validation(
                "timer must belong to a process instance",
            ));
        }
        let due = timer
            .due_date
            .ok_or_else(|| OrchestrationError::validation("timer due date is required"))?;
        let rule = timer.repeat.as_deref().map(RepeatRule::parse).transpose()?;

        let remaining = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !remaining.is_zero() {
            cache::set_json(
                self.inner.cache.as_ref(),
                &cache::timer_key(&timer.timer_id),
                &timer,
                remaining,
            )
            .await;
        }

        let (generation, cancel_rx) = self.inner.timers.arm(&timer.timer_id);
        let timer_id = timer.timer_id.clone();
        let task = tokio::spawn(self.clone().run_timer(timer, rule, remaining, generation, cancel_rx));
        self.inner.timers.attach(&timer_id, generation, task);

        orchestration_metrics().record_timer_scheduled();
        info!(timer_id = %timer_id, due = %due, in_ms = remaining.as_millis() as u64, "Timer scheduled");
        Ok(())
    }

    async fn run_timer(
        self,
        timer: TimerEvent,
        rule: Option<RepeatRule>,
        first_wait: Duration,
        generation: u64,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let mut deadline = tokio::time::Instant::now() + first_wait;
        let mut due = timer.due_date.unwrap_or_else(Utc::now);
        let mut fired: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = wait_for_cancel(&mut cancel_rx) => {
                    debug!(timer_id = %timer.timer_id, "Timer task stopped");
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }

            fired += 1;
            let rearm = rule.map(|r| r.has_next(fired)).unwrap_or(false);
            let decision = self.inner.timers.claim_fire(&timer.timer_id, generation, rearm);
            if decision == FireDecision::Skip {
                return;
            }

            self.fire(&timer, due, fired).await;

            match (decision, rule) {
                (FireDecision::FireAndRearm, Some(rule)) => {
                    deadline += rule.interval;
                    due += chrono::Duration::from_std(rule.interval)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    self.cache_rearmed(&timer, generation, due, rule.interval).await;
                }
                _ => {
                    self.inner.timers.release(&timer.timer_id, generation);
                    return;
                }
            }
        }
    }

    /// Point the cached timer at its next due date.
    async fn cache_rearmed(
        &self,
        timer: &TimerEvent,
        generation: u64,
        due: chrono::DateTime<Utc>,
        ttl: Duration,
    ) {
        let timers = &self.inner.timers;
        if !timers.is_current(&timer.timer_id, generation) {
            return;
        }
        let key = cache::timer_key(&timer.timer_id);
        let mut next = timer.clone();
        next.due_date = Some(due);
        cache::set_json(self.inner.cache.as_ref(), &key, &next, ttl).await;

        // Cancelled while the entry was being written.
        if !timers.is_active(&timer.timer_id) {
            cache::invalidate(self.inner.cache.as_ref(), &key).await;
        }
    }

    async fn fire(&self, timer: &TimerEvent, due: chrono::DateTime<Utc>, occurrence: u32) {
        let mut payload = serde_json::Map::new();
        payload.insert("timer_id".to_string(), timer.timer_id.clone().into());
        payload.insert("due_date".to_string(), due.to_rfc3339().into());
        payload.insert("occurrence".to_string(), occurrence.into());

        let mut event = ProcessEvent::new(
            EVENT_TIMER,
            timer.timer_id.clone(),
            timer.process_instance_id.clone(),
        )
        .with_payload(payload);
        event.id = event_id(&format!("timer_{}", timer.timer_id));
        event.activity_id = timer.activity_id.clone();
        event.tenant_id = timer.tenant_id.clone();

        orchestration_metrics().record_timer_fired();
        match self.publish_event(event).await {
            Ok(event) => info!(timer_id = %timer.timer_id, event_id = %event.id, occurrence, "Timer fired"),
            Err(e) => warn!(timer_id = %timer.timer_id, error = %e, "Failed to publish timer event"),
        }
    }

    /// Cancel a timer. Unknown ids are a no-op.
    pub async fn cancel_timer(&self, timer_id: &str) -> OrchestrationResult<()> {
        if timer_id.is_empty() {
            return Err(OrchestrationError::validation("timer id must not be empty"));
        }

        cache::invalidate(self.inner.cache.as_ref(), &cache::timer_key(timer_id)).await;

        if self.inner.timers.cancel(timer_id) {
            orchestration_metrics().record_timer_cancelled();
            info!(timer_id = %timer_id, "Timer cancelled");
        } else {
            debug!(timer_id = %timer_id, "Cancel requested for inactive timer");
        }
        Ok(())
    }

    pub fn active_timers(&self) -> Vec<String> {
        self.inner.timers.active_timer_ids()
    }

    pub fn is_timer_active(&self, timer_id: &str) -> bool {
        self.inner.timers.is_active(timer_id)
    }

    /// Events for an instance, served from cache when possible.
    pub async fn get_process_events(
        &self,
        process_instance_id: &str,
    ) -> OrchestrationResult<Vec<ProcessEvent>> {
        if process_instance_id.is_empty() {
            return Err(OrchestrationError::validation(
                "process instance id must not be empty",
            ));
        }

        let key = cache::process_events_key(process_instance_id);
        let cache = self.inner.cache.as_ref();
        if let Some(events) = cache::get_json::<Vec<ProcessEvent>>(cache, &key).await {
            return Ok(events);
        }

        // A publish racing this read may invalidate before the stale listing
        // lands in the cache. Drop the entry again if any publish happened.
        let before = self.inner.publishes.load(Ordering::SeqCst);
        let events = self.inner.events.list_events(process_instance_id).await?;
        cache::set_json(cache, &key, &events, self.inner.ttls.process_events).await;
        if self.inner.publishes.load(Ordering::SeqCst) != before {
            cache::invalidate(cache, &key).await;
        }
        Ok(events)
    }

    /// Stop every armed timer.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.inner.timers.cancel_all();
        info!(cancelled, "Event coordinator stopped timers");
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, MockCacheRepository, MokaCache};
    use crate::store::{InMemoryStore, MockProcessEventRepository, StoreError, StoreResult};
    use async_trait::async_trait;

    /// Returns the listing as it was when the read started, after a delay.
    struct LaggingListing {
        inner: InMemoryStore,
    }

    #[async_trait]
    impl ProcessEventRepository for LaggingListing {
        async fn append_event(&self, event: &ProcessEvent) -> StoreResult<()> {
            self.inner.append_event(event).await
        }

        async fn get_event(&self, id: &str) -> StoreResult<ProcessEvent> {
            self.inner.get_event(id).await
        }

        async fn list_events(&self, process_instance_id: &str) -> StoreResult<Vec<ProcessEvent>> {
            let events = self.inner.list_events(process_instance_id).await?;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(events)
        }
    }

    fn coordinator() -> EventCoordinator {
        EventCoordinator::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(MokaCache::default()),
            CacheTtls::default(),
        )
    }

    #[tokio::test]
    async fn test_publish_requires_type_and_instance() {
        let coordinator = coordinator();
        let err = coordinator
            .publish_event(ProcessEvent::new("", "x", "pi-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));

        let err = coordinator
            .publish_event(ProcessEvent::new("signal", "x", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_publish_survives_cache_outage() {
        let mut cache = MockCacheRepository::new();
        cache
            .expect_set()
            .returning(|_, _, _| Err(CacheError::Unavailable("down".to_string())));
        cache
            .expect_delete()
            .returning(|_| Err(CacheError::Unavailable("down".to_string())));

        let coordinator = EventCoordinator::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(cache),
            CacheTtls::default(),
        );
        let event = coordinator
            .publish_event(ProcessEvent::new("signal", "go", "pi-1"))
            .await
            .unwrap();
        assert!(!event.id.is_empty());
        assert!(event.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_publish_surfaces_store_failure() {
        let mut events = MockProcessEventRepository::new();
        events
            .expect_append_event()
            .returning(|_| Err(StoreError::Backend("disk full".to_string())));

        let coordinator = EventCoordinator::new(
            Arc::new(events),
            Arc::new(MokaCache::default()),
            CacheTtls::default(),
        );
        let err = coordinator
            .publish_event(ProcessEvent::new("signal", "go", "pi-1"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_signal_without_target_is_broadcast() {
        let coordinator = coordinator();
        let event = coordinator
            .send_signal(SignalEvent {
                signal_name: "alarm".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(event.process_instance_id, BROADCAST_INSTANCE);
        assert!(event.id.starts_with("signal_alarm_"));
    }

    #[tokio::test]
    async fn test_message_folds_correlation_keys() {
        let coordinator = coordinator();
        let mut keys = HashMap::new();
        keys.insert("order_id".to_string(), "o-9".to_string());

        let event = coordinator
            .send_message(MessageEvent {
                message_name: "payment_received".to_string(),
                process_instance_id: Some("pi-7".to_string()),
                correlation_keys: keys,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(event.payload["correlation_keys"]["order_id"], "o-9");
    }

    #[tokio::test]
    async fn test_uncorrelated_message_is_not_found() {
        let coordinator = coordinator();
        let mut keys = HashMap::new();
        keys.insert("order_id".to_string(), "o-9".to_string());

        let err = coordinator
            .send_message(MessageEvent {
                message_name: "payment_received".to_string(),
                correlation_keys: keys,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_timer_requests() {
        let coordinator = coordinator();
        let mut timer = TimerEvent::new("", "pi-1", Utc::now());
        assert!(coordinator.schedule_timer(timer.clone()).await.is_err());

        timer.timer_id = "t1".to_string();
        timer.due_date = None;
        assert!(coordinator.schedule_timer(timer.clone()).await.is_err());

        timer.due_date = Some(Utc::now());
        timer.repeat = Some("sometimes".to_string());
        assert!(coordinator.schedule_timer(timer).await.is_err());
        assert!(coordinator.active_timers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_during_listing_leaves_no_stale_cache() {
        let coordinator = EventCoordinator::new(
            Arc::new(LaggingListing {
                inner: InMemoryStore::new(),
            }),
            Arc::new(MokaCache::default()),
            CacheTtls::default(),
        );
        coordinator
            .publish_event(ProcessEvent::new("signal", "first", "pi-1"))
            .await
            .unwrap();

        let reader = coordinator.clone();
        let listing = tokio::spawn(async move { reader.get_process_events("pi-1").await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        coordinator
            .publish_event(ProcessEvent::new("signal", "second", "pi-1"))
            .await
            .unwrap();

        assert_eq!(listing.await.unwrap().unwrap().len(), 1);
        let listed = coordinator.get_process_events("pi-1").await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearmed_timer_refreshes_cached_due_date() {
        let cache = Arc::new(MokaCache::default());
        let coordinator = EventCoordinator::new(
            Arc::new(InMemoryStore::new()),
            cache.clone(),
            CacheTtls::default(),
        );
        let due = Utc::now() + chrono::Duration::seconds(1);
        let mut timer = TimerEvent::new("reminder", "pi-1", due);
        timer.repeat = Some("R3/PT10M".to_string());
        coordinator.schedule_timer(timer).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        let cached: TimerEvent = cache::get_json(cache.as_ref(), &cache::timer_key("reminder"))
            .await
            .unwrap();
        assert_eq!(cached.due_date, Some(due + chrono::Duration::minutes(10)));
        assert!(coordinator.is_timer_active("reminder"));

        coordinator.cancel_timer("reminder").await.unwrap();
        assert!(
            cache::get_json::<TimerEvent>(cache.as_ref(), &cache::timer_key("reminder"))
                .await
                .is_none()
        );
    }
}
