//! Cache abstraction used for read-through lookups of instances, tasks and
//! events. Cache failures are never fatal: the helpers in this module log
//! them and fall back to the durable store.

mod moka_cache;

pub use moka_cache::MokaCache;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::observability::orchestration_metrics;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("Cache value could not be encoded: {0}")]
    Encoding(String),
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait CacheRepository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Reset the time-to-live of an existing entry. Missing keys are ignored.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;
}

pub fn process_instance_key(id: &str) -> String {
    format!("process_instance:{}", id)
}

pub fn task_instance_key(id: &str) -> String {
    format!("task_instance:{}", id)
}

pub fn process_event_key(id: &str) -> String {
    format!("process_event:{}", id)
}

pub fn process_events_key(process_instance_id: &str) -> String {
    format!("process_events:{}", process_instance_id)
}

pub fn timer_key(timer_id: &str) -> String {
    format!("timer_event:{}", timer_id)
}

/// Time-to-live per cached record kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub process_instance: Duration,
    pub task_instance: Duration,
    pub process_event: Duration,
    pub process_events: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            process_instance: Duration::from_secs(30 * 60),
            task_instance: Duration::from_secs(15 * 60),
            process_event: Duration::from_secs(60 * 60),
            process_events: Duration::from_secs(30 * 60),
        }
    }
}

impl From<&CacheConfig> for CacheTtls {
    fn from(config: &CacheConfig) -> Self {
        Self {
            process_instance: Duration::from_secs(config.process_instance_ttl_seconds),
            task_instance: Duration::from_secs(config.task_instance_ttl_seconds),
            process_event: Duration::from_secs(config.process_event_ttl_seconds),
            process_events: Duration::from_secs(config.process_events_ttl_seconds),
        }
    }
}

/// Read and decode a cached JSON value. Any failure counts as a miss.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn CacheRepository, key: &str) -> Option<T> {
    match cache.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!("Cache hit for key: {}", key);
                orchestration_metrics().record_cache_hit();
                Some(value)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                orchestration_metrics().record_cache_miss();
                None
            }
        },
        Ok(None) => {
            orchestration_metrics().record_cache_miss();
            None
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Cache read failed");
            orchestration_metrics().record_cache_miss();
            None
        }
    }
}

/// Encode and store a JSON value, logging instead of failing.
pub async fn set_json<T: Serialize>(
    cache: &dyn CacheRepository,
    key: &str,
    value: &T,
    ttl: Duration,
) {
    let raw = match serde_json::to_string(value) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to encode value for cache");
            return;
        }
    };

    if let Err(e) = cache.set(key, raw, ttl).await {
        warn!(key = %key, error = %e, "Cache write failed");
    }
}

/// Remove a key, logging instead of failing.
pub async fn invalidate(cache: &dyn CacheRepository, key: &str) {
    match cache.delete(key).await {
        Ok(()) => debug!("Invalidated cache key: {}", key),
        Err(e) => warn!(key = %key, error = %e, "Cache invalidation failed"),
    }
}
