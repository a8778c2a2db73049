use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::types::{ProcessEvent, WILDCARD};
use crate::observability::orchestration_metrics;

/// Handler invoked for every published event of the types it was
/// registered under.
#[async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &ProcessEvent) -> anyhow::Result<()>;
}

/// Maps event types to listeners. `*` receives everything.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<String, Vec<Arc<dyn EventListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event_type: &str, listener: Arc<dyn EventListener>) {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug!(event_type = %event_type, listener = %listener.name(), "Registering event listener");
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(listener);
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        let listeners = match self.listeners.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.get(event_type).map(Vec::len).unwrap_or(0)
    }

    fn matching(&self, event_type: &str) -> Vec<Arc<dyn EventListener>> {
        let listeners = match self.listeners.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut matched: Vec<Arc<dyn EventListener>> = Vec::new();
        if let Some(specific) = listeners.get(event_type) {
            matched.extend(specific.iter().cloned());
        }
        if event_type != WILDCARD {
            if let Some(all) = listeners.get(WILDCARD) {
                matched.extend(all.iter().cloned());
            }
        }
        matched
    }

    /// Run every matching listener in its own task.
    ///
    /// The returned handles complete once the listener finished; a failing
    /// or panicking listener is logged and counted but never propagates.
    pub fn dispatch(&self, event: &ProcessEvent) -> Vec<JoinHandle<()>> {
        self.matching(&event.event_type)
            .into_iter()
            .map(|listener| {
                let event = event.clone();
                tokio::spawn(async move {
                    let name = listener.name().to_string();
                    let event_id = event.id.clone();
                    let inner = tokio::spawn(async move { listener.on_event(&event).await });

                    match inner.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            orchestration_metrics().record_listener_failure();
                            warn!(listener = %name, event_id = %event_id, error = %e, "Event listener failed");
                        }
                        Err(join_error) => {
                            orchestration_metrics().record_listener_failure();
                            warn!(listener = %name, event_id = %event_id, error = %join_error, "Event listener panicked");
                        }
                    }
                })
            })
            .collect()
    }
}
