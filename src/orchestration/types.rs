use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::variables::VariableMap;

pub const PROCESS_COMPLETE_SIGNAL: &str = "complete";
pub const TASK_COMPLETE_SIGNAL: &str = "task_complete";
pub const APPROVAL_SIGNAL: &str = "approval";

pub const INITIATOR_VARIABLE: &str = "initiator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Timeout,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessRunInput {
    pub process_definition_id: i64,
    pub process_instance_id: String,
    pub business_key: Option<String>,
    #[serde(default)]
    pub variables: VariableMap,
    pub initiator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRunResult {
    pub process_instance_id: String,
    pub status: RunStatus,
    /// Payload of the completion signal, or the failure reason.
    pub result: serde_json::Value,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRunInput {
    pub task_id: String,
    pub assignee: Option<String>,
    #[serde(default)]
    pub variables: VariableMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunResult {
    pub task_id: String,
    pub status: RunStatus,
    pub result: serde_json::Value,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub requestor: String,
    /// Ordered approver ids. Duplicates collapse when counting votes.
    pub approvers: Vec<String>,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(with = "duration_secs")]
    pub deadline: Duration,
    pub require_all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalVote {
    pub approver: String,
    pub approved: bool,
    #[serde(default)]
    pub comments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Approved,
    Rejected,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalWorkflowResult {
    pub request_id: String,
    pub status: ApprovalStatus,
    pub approved: bool,
    pub comments: String,
    pub votes: BTreeMap<String, bool>,
    pub end_time: DateTime<Utc>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
