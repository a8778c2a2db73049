use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::variables::VariableMap;

pub const EVENT_SIGNAL: &str = "signal";
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_TIMER: &str = "timer";
pub const EVENT_PROCESS_STARTED: &str = "process_started";
pub const EVENT_PROCESS_COMPLETED: &str = "process_completed";
pub const EVENT_PROCESS_SUSPENDED: &str = "process_suspended";
pub const EVENT_PROCESS_ACTIVATED: &str = "process_activated";
pub const EVENT_PROCESS_TERMINATED: &str = "process_terminated";
pub const EVENT_TASK_CREATED: &str = "task_created";
pub const EVENT_TASK_ASSIGNED: &str = "task_assigned";
pub const EVENT_TASK_COMPLETED: &str = "task_completed";
pub const EVENT_APPROVAL_REQUEST: &str = "approval_request";
pub const EVENT_APPROVAL_COMPLETED: &str = "approval_completed";

/// Listener key matching every event type.
pub const WILDCARD: &str = "*";

/// Instance id recorded for signals that target no particular instance.
pub const BROADCAST_INSTANCE: &str = "broadcast";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub id: String,
    pub event_type: String,
    pub event_name: String,
    pub process_instance_id: String,
    pub activity_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub timestamp: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl ProcessEvent {
    pub fn new(
        event_type: impl Into<String>,
        event_name: impl Into<String>,
        process_instance_id: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            event_type: event_type.into(),
            event_name: event_name.into(),
            process_instance_id: process_instance_id.into(),
            activity_id: None,
            payload: serde_json::Map::new(),
            timestamp: None,
            user_id: None,
            tenant_id: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Map<String, serde_json::Value>) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalEvent {
    pub signal_name: String,
    pub process_instance_id: Option<String>,
    #[serde(default)]
    pub variables: VariableMap,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message_name: String,
    pub process_instance_id: Option<String>,
    #[serde(default)]
    pub correlation_keys: HashMap<String, String>,
    #[serde(default)]
    pub variables: VariableMap,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerEvent {
    pub timer_id: String,
    pub process_instance_id: String,
    pub activity_id: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    /// ISO-8601 repeating interval, e.g. `R3/PT10M`.
    pub repeat: Option<String>,
    pub tenant_id: Option<String>,
}

impl TimerEvent {
    pub fn new(
        timer_id: impl Into<String>,
        process_instance_id: impl Into<String>,
        due_date: DateTime<Utc>,
    ) -> Self {
        Self {
            timer_id: timer_id.into(),
            process_instance_id: process_instance_id.into(),
            activity_id: None,
            due_date: Some(due_date),
            repeat: None,
            tenant_id: None,
        }
    }
}
