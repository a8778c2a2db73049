use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrchestrationError;
use crate::lifecycle::{DelegationState, TaskInstance};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskCommand {
    Claim { user_id: String },
    Complete { user_id: String },
    Delegate { user_id: String, delegate_to: String },
}

/// Coarse position of a task in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Unassigned,
    Claimed,
    Delegated,
    Completed,
}

impl TaskPhase {
    pub fn of(task: &TaskInstance) -> Self {
        if task.is_completed() {
            TaskPhase::Completed
        } else if task.delegation == DelegationState::Pending {
            TaskPhase::Delegated
        } else if task.assignee.is_some() {
            TaskPhase::Claimed
        } else {
            TaskPhase::Unassigned
        }
    }
}

/// Apply a command to a task in place.
///
/// On error the task is left untouched.
pub fn apply(
    task: &mut TaskInstance,
    command: &TaskCommand,
    now: DateTime<Utc>,
) -> Result<TaskPhase, OrchestrationError> {
    match (TaskPhase::of(task), command) {
        (TaskPhase::Completed, _) => Err(OrchestrationError::conflict(format!(
            "task {} is already completed",
            task.id
        ))),

        (_, TaskCommand::Claim { user_id }) => {
            if user_id.is_empty() {
                return Err(OrchestrationError::validation("assignee must not be empty"));
            }
            match task.assignee.as_deref() {
                Some(current) if current != user_id => Err(OrchestrationError::conflict(format!(
                    "task {} is already assigned to {}",
                    task.id, current
                ))),
                Some(_) => Ok(TaskPhase::of(task)),
                None => {
                    task.assignee = Some(user_id.clone());
                    Ok(TaskPhase::Claimed)
                }
            }
        }

        (TaskPhase::Unassigned, TaskCommand::Complete { .. }) => {
            Err(OrchestrationError::permission_denied(format!(
                "task {} must be claimed before completion",
                task.id
            )))
        }

        (_, TaskCommand::Complete { user_id }) => {
            if task.assignee.as_deref() != Some(user_id.as_str()) {
                return Err(OrchestrationError::permission_denied(format!(
                    "only the assignee may complete task {}",
                    task.id
                )));
            }
            if task.delegation == DelegationState::Pending {
                task.delegation = DelegationState::Resolved;
            }
            task.completed_at = Some(now);
            Ok(TaskPhase::Completed)
        }

        (_, TaskCommand::Delegate {
            user_id,
            delegate_to,
        }) => {
            if delegate_to.is_empty() {
                return Err(OrchestrationError::validation("delegate must not be empty"));
            }
            let is_assignee = task.assignee.as_deref() == Some(user_id.as_str());
            let is_owner = task.owner.as_deref() == Some(user_id.as_str());
            if !is_assignee && !is_owner {
                return Err(OrchestrationError::permission_denied(format!(
                    "only the assignee or owner may delegate task {}",
                    task.id
                )));
            }
            if task.owner.is_none() {
                task.owner = task.assignee.clone();
            }
            task.assignee = Some(delegate_to.clone());
            task.delegation = DelegationState::Pending;
            Ok(TaskPhase::Delegated)
        }
    }
}
