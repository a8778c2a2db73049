use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{OrchestrationError, OrchestrationResult};
use crate::events::{
    EventListener, MessageCorrelator, ProcessEvent, BROADCAST_INSTANCE, EVENT_MESSAGE,
    EVENT_SIGNAL,
};

type ChannelKey = (String, String);

struct Subscription {
    sender: mpsc::Sender<serde_json::Value>,
    correlation_keys: HashMap<String, String>,
}

/// Named delivery channels for waiting runs, keyed by `(run id, channel)`.
///
/// Signals for a channel nobody is waiting on are dropped.
pub struct SignalHub {
    channels: Mutex<HashMap<ChannelKey, Subscription>>,
    buffer: usize,
}

impl SignalHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelKey, Subscription>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(
        &self,
        run_id: &str,
        channel: &str,
    ) -> OrchestrationResult<mpsc::Receiver<serde_json::Value>> {
        self.register_with_keys(run_id, channel, HashMap::new())
    }

    /// Register a channel that messages can also reach through correlation keys.
    pub fn register_with_keys(
        &self,
        run_id: &str,
        channel: &str,
        correlation_keys: HashMap<String, String>,
    ) -> OrchestrationResult<mpsc::Receiver<serde_json::Value>> {
        let mut channels = self.lock();
        let key = (run_id.to_string(), channel.to_string());
        if channels.get(&key).is_some_and(|s| !s.sender.is_closed()) {
            return Err(OrchestrationError::conflict(format!(
                "run {} is already waiting on '{}'",
                run_id, channel
            )));
        }

        let (sender, receiver) = mpsc::channel(self.buffer);
        channels.insert(
            key,
            Subscription {
                sender,
                correlation_keys,
            },
        );
        debug!(run_id = %run_id, channel = %channel, "Registered signal channel");
        Ok(receiver)
    }

    pub fn unregister(&self, run_id: &str, channel: &str) {
        self.lock()
            .remove(&(run_id.to_string(), channel.to_string()));
    }

    /// Deliver a payload. Returns whether a waiting run received it.
    pub fn signal(
        &self,
        run_id: &str,
        channel: &str,
        payload: serde_json::Value,
    ) -> OrchestrationResult<bool> {
        let mut channels = self.lock();
        let key = (run_id.to_string(), channel.to_string());
        let Some(subscription) = channels.get(&key) else {
            debug!(run_id = %run_id, channel = %channel, "No waiter for signal");
            return Ok(false);
        };

        match subscription.sender.try_send(payload) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                channels.remove(&key);
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(OrchestrationError::Transient(format!(
                "signal channel '{}' of run {} is full",
                channel, run_id
            ))),
        }
    }

    /// Deliver to every run waiting on `channel`. Returns the number reached.
    pub fn broadcast(&self, channel: &str, payload: serde_json::Value) -> usize {
        let channels = self.lock();
        channels
            .iter()
            .filter(|((_, name), _)| name == channel)
            .filter(|(_, s)| s.sender.try_send(payload.clone()).is_ok())
            .count()
    }

    pub fn is_waiting(&self, run_id: &str, channel: &str) -> bool {
        self.lock()
            .get(&(run_id.to_string(), channel.to_string()))
            .is_some_and(|s| !s.sender.is_closed())
    }
}

impl MessageCorrelator for SignalHub {
    fn correlate(&self, message_name: &str, keys: &HashMap<String, String>) -> Option<String> {
        let channels = self.lock();
        let mut matches = channels.iter().filter(|((_, name), subscription)| {
            name == message_name
                && !subscription.correlation_keys.is_empty()
                && keys
                    .iter()
                    .all(|(k, v)| subscription.correlation_keys.get(k) == Some(v))
        });

        let first = matches.next().map(|((run_id, _), _)| run_id.clone());
        if matches.next().is_some() {
            warn!(message = %message_name, "Message correlation is ambiguous");
            return None;
        }
        first
    }
}

/// Routes published `signal` and `message` events to waiting runs.
pub struct SignalBridge {
    hub: Arc<SignalHub>,
}

impl SignalBridge {
    pub fn new(hub: Arc<SignalHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl EventListener for SignalBridge {
    fn name(&self) -> &str {
        "signal-bridge"
    }

    async fn on_event(&self, event: &ProcessEvent) -> anyhow::Result<()> {
        if event.event_type != EVENT_SIGNAL && event.event_type != EVENT_MESSAGE {
            return Ok(());
        }

        let payload = serde_json::Value::Object(event.payload.clone());
        if event.process_instance_id == BROADCAST_INSTANCE {
            let reached = self.hub.broadcast(&event.event_name, payload);
            debug!(signal = %event.event_name, reached, "Broadcast signal delivered");
        } else {
            self.hub
                .signal(&event.process_instance_id, &event.event_name, payload)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_signal_reaches_registered_run() {
        let hub = SignalHub::new(4);
        let mut rx = hub.register("pi-1", "complete").unwrap();
        assert!(hub.signal("pi-1", "complete", json!({"ok": true})).unwrap());
        assert_eq!(rx.recv().await.unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_signal_without_waiter_is_dropped() {
        let hub = SignalHub::new(4);
        assert!(!hub.signal("pi-1", "complete", json!({})).unwrap());
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let hub = SignalHub::new(4);
        let _rx = hub.register("pi-1", "complete").unwrap();
        assert!(matches!(
            hub.register("pi-1", "complete"),
            Err(OrchestrationError::Conflict(_))
        ));
    }

    #[test]
    fn test_dropped_receiver_allows_reregistration() {
        let hub = SignalHub::new(4);
        drop(hub.register("pi-1", "complete").unwrap());
        assert!(hub.register("pi-1", "complete").is_ok());
    }

    #[test]
    fn test_full_channel_is_transient() {
        let hub = SignalHub::new(1);
        let _rx = hub.register("req-1", "approval").unwrap();
        hub.signal("req-1", "approval", json!(1)).unwrap();
        let err = hub.signal("req-1", "approval", json!(2)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_correlation_requires_unique_match() {
        let hub = SignalHub::new(4);
        let keys = |v: &str| HashMap::from([("order_id".to_string(), v.to_string())]);
        let _a = hub.register_with_keys("pi-1", "paid", keys("o-1")).unwrap();
        let _b = hub.register_with_keys("pi-2", "paid", keys("o-2")).unwrap();

        assert_eq!(hub.correlate("paid", &keys("o-2")), Some("pi-2".to_string()));
        assert_eq!(hub.correlate("paid", &HashMap::new()), None);
        assert_eq!(hub.correlate("shipped", &keys("o-1")), None);
    }
}
