use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::NotificationConfig;
use crate::events::{
    EventCoordinator, ProcessEvent, EVENT_APPROVAL_COMPLETED, EVENT_APPROVAL_REQUEST,
    EVENT_PROCESS_COMPLETED, EVENT_PROCESS_STARTED, EVENT_TASK_ASSIGNED, EVENT_TASK_COMPLETED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ProcessStarted,
    ProcessCompleted,
    TaskAssigned,
    TaskCompleted,
    ApprovalRequest,
    ApprovalCompleted,
}

impl NotificationKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            NotificationKind::ProcessStarted => EVENT_PROCESS_STARTED,
            NotificationKind::ProcessCompleted => EVENT_PROCESS_COMPLETED,
            NotificationKind::TaskAssigned => EVENT_TASK_ASSIGNED,
            NotificationKind::TaskCompleted => EVENT_TASK_COMPLETED,
            NotificationKind::ApprovalRequest => EVENT_APPROVAL_REQUEST,
            NotificationKind::ApprovalCompleted => EVENT_APPROVAL_COMPLETED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: String,
    /// Instance, task or approval request the notification is about.
    pub subject_id: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
    #[error("Notification rejected: {0}")]
    Rejected(String),
}

/// Outbound notification channel. Callers treat failures as best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        info!(
            kind = ?notification.kind,
            recipient = %notification.recipient,
            subject_id = %notification.subject_id,
            "Notification sent"
        );
        Ok(())
    }
}

/// Records notifications as process events so listeners can pick them up.
#[derive(Clone)]
pub struct EventNotifier {
    events: EventCoordinator,
}

impl EventNotifier {
    pub fn new(events: EventCoordinator) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Notifier for EventNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let mut payload = notification.payload;
        payload.insert(
            "recipient".to_string(),
            serde_json::Value::String(notification.recipient.clone()),
        );

        let mut event = ProcessEvent::new(
            notification.kind.event_type(),
            notification.kind.event_type(),
            notification.subject_id,
        )
        .with_payload(payload);
        event.user_id = Some(notification.recipient);

        self.events
            .publish_event(event)
            .await
            .map(|_| ())
            .map_err(|e| NotifyError::Delivery(e.to_string()))
    }
}

/// Throttles another notifier to a steady rate with bursts.
pub struct RateLimitedNotifier {
    inner: Arc<dyn Notifier>,
    limiter: DefaultDirectRateLimiter,
}

impl RateLimitedNotifier {
    pub fn new(inner: Arc<dyn Notifier>, config: &NotificationConfig) -> Self {
        let per_second = NonZeroU32::new(config.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);

        Self {
            inner,
            limiter: RateLimiter::direct(quota),
        }
    }
}

#[async_trait]
impl Notifier for RateLimitedNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.limiter.until_ready().await;
        self.inner.notify(notification).await
    }
}
