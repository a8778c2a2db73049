use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::variables::VariableMap;

pub const DEFAULT_TASK_PRIORITY: i32 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub version: i32,
    pub suspended: bool,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: String,
    pub process_definition_id: i64,
    pub process_definition_key: String,
    pub process_definition_version: i32,
    pub business_key: Option<String>,
    pub name: Option<String>,
    pub start_user_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between start and end, set on termination.
    pub duration_ms: Option<i64>,
    pub suspended: bool,
    pub delete_reason: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub variables: VariableMap,
}

impl ProcessInstance {
    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationState {
    #[default]
    None,
    Pending,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: String,
    pub process_instance_id: String,
    pub name: String,
    pub task_definition_key: String,
    pub assignee: Option<String>,
    pub owner: Option<String>,
    #[serde(default)]
    pub delegation: DelegationState,
    pub priority: i32,
    pub create_time: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub variables: VariableMap,
}

impl TaskInstance {
    pub fn new(
        id: impl Into<String>,
        process_instance_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            process_instance_id: process_instance_id.into(),
            task_definition_key: name.clone(),
            name,
            assignee: None,
            owner: None,
            delegation: DelegationState::None,
            priority: DEFAULT_TASK_PRIORITY,
            create_time: Utc::now(),
            due_date: None,
            completed_at: None,
            tenant_id: None,
            variables: VariableMap::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Request for starting a new process instance. Exactly one of the
/// definition id or key must be given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartProcessRequest {
    pub process_definition_id: Option<i64>,
    pub process_definition_key: Option<String>,
    pub business_key: Option<String>,
    pub name: Option<String>,
    pub start_user_id: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub variables: VariableMap,
}
