//! Line-oriented command intake behind `serve`.
//!
//! Every input line is one JSON object tagged by `op`, for example
//! `{"op":"signal","signal_name":"complete","process_instance_id":"..."}`.
//! Each line gets one reply. Runs started by a command report their final
//! result later on the report channel.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{OrchestrationError, OrchestrationResult};
use crate::events::{EventCoordinator, MessageEvent, SignalEvent, TimerEvent};
use crate::lifecycle::{
    InstanceLifecycleService, ProcessDefinition, StartProcessRequest, TaskInstance,
};
use crate::orchestration::{
    ApprovalAggregator, ApprovalRequest, ApprovalVote, OrchestrationDriver, ProcessRunInput,
    TaskRunInput, INITIATOR_VARIABLE,
};
use crate::store::ProcessDefinitionRepository;
use crate::variables::{self, VariableValue};

type JsonObject = serde_json::Map<String, Value>;

fn first_version() -> i32 {
    1
}

/// One intake command. Variables are plain JSON objects.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    DeployDefinition {
        id: i64,
        key: String,
        name: Option<String>,
        #[serde(default = "first_version")]
        version: i32,
        #[serde(default)]
        suspended: bool,
        tenant_id: Option<String>,
    },
    StartProcess {
        process_definition_id: Option<i64>,
        process_definition_key: Option<String>,
        business_key: Option<String>,
        start_user_id: Option<String>,
        #[serde(default)]
        variables: JsonObject,
    },
    Suspend {
        process_instance_id: String,
    },
    Activate {
        process_instance_id: String,
    },
    Terminate {
        process_instance_id: String,
        #[serde(default)]
        reason: String,
    },
    Signal {
        signal_name: String,
        process_instance_id: Option<String>,
        #[serde(default)]
        variables: JsonObject,
    },
    Message {
        message_name: String,
        process_instance_id: Option<String>,
        #[serde(default)]
        correlation_keys: HashMap<String, String>,
        #[serde(default)]
        variables: JsonObject,
    },
    CreateTask {
        task_id: String,
        process_instance_id: String,
        name: String,
        assignee: Option<String>,
    },
    ClaimTask {
        task_id: String,
        user_id: String,
    },
    CompleteTask {
        task_id: String,
        user_id: String,
        #[serde(default)]
        variables: JsonObject,
    },
    DelegateTask {
        task_id: String,
        user_id: String,
        delegate_to: String,
    },
    RequestApproval {
        request_id: String,
        requestor: String,
        approvers: Vec<String>,
        #[serde(default)]
        content: Value,
        deadline_secs: u64,
        #[serde(default)]
        require_all: bool,
    },
    Vote {
        request_id: String,
        approver: String,
        approved: bool,
        #[serde(default)]
        comments: String,
    },
    ScheduleTimer {
        timer_id: String,
        process_instance_id: String,
        delay_ms: u64,
        repeat: Option<String>,
    },
    CancelTimer {
        timer_id: String,
    },
    Events {
        process_instance_id: String,
    },
}

#[derive(Debug, Serialize)]
struct ErrorReply {
    kind: crate::error::ErrorKind,
    message: String,
}

/// Dispatches commands to the lifecycle service, the driver, the approval
/// aggregator and the event coordinator.
pub struct Intake {
    definitions: Arc<dyn ProcessDefinitionRepository>,
    lifecycle: InstanceLifecycleService,
    driver: OrchestrationDriver,
    approvals: ApprovalAggregator,
    events: EventCoordinator,
    reports: mpsc::UnboundedSender<Value>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl Intake {
    /// Build the intake and the channel its run reports arrive on.
    pub fn new(
        definitions: Arc<dyn ProcessDefinitionRepository>,
        lifecycle: InstanceLifecycleService,
        driver: OrchestrationDriver,
        approvals: ApprovalAggregator,
        events: EventCoordinator,
    ) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let intake = Self {
            definitions,
            lifecycle,
            driver,
            approvals,
            events,
            reports,
            pending: Mutex::new(Vec::new()),
        };
        (intake, rx)
    }

    /// Parse and execute one input line. Blank lines get no reply.
    pub async fn handle_line(&self, line: &str) -> Option<Value> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let outcome = match serde_json::from_str::<Command>(line) {
            Ok(command) => self.execute(command).await,
            Err(e) => Err(OrchestrationError::validation(format!("bad command: {}", e))),
        };
        Some(match outcome {
            Ok(result) => json!({ "ok": true, "result": result }),
            Err(e) => {
                debug!(error = %e, "Command failed");
                json!({
                    "ok": false,
                    "error": ErrorReply { kind: e.kind(), message: e.to_string() },
                })
            }
        })
    }

    pub async fn execute(&self, command: Command) -> OrchestrationResult<Value> {
        match command {
            Command::DeployDefinition {
                id,
                key,
                name,
                version,
                suspended,
                tenant_id,
            } => {
                if id <= 0 || key.is_empty() {
                    return Err(OrchestrationError::validation(
                        "definition needs a positive id and a key",
                    ));
                }
                let definition = ProcessDefinition {
                    id,
                    name: name.unwrap_or_else(|| key.clone()),
                    key,
                    version,
                    suspended,
                    tenant_id,
                };
                self.definitions.save_definition(&definition).await?;
                to_reply(&definition)
            }

            Command::StartProcess {
                process_definition_id,
                process_definition_key,
                business_key,
                start_user_id,
                variables,
            } => {
                let mut variables = variables::from_json_object(variables);
                if let Some(user) = &start_user_id {
                    variables
                        .entry(INITIATOR_VARIABLE.to_string())
                        .or_insert_with(|| VariableValue::String(user.clone()));
                }
                let instance = self
                    .lifecycle
                    .start_process_instance(StartProcessRequest {
                        process_definition_id,
                        process_definition_key,
                        business_key: business_key.clone(),
                        start_user_id: start_user_id.clone(),
                        variables: variables.clone(),
                        ..Default::default()
                    })
                    .await?;

                let run = self.driver.start_process(ProcessRunInput {
                    process_definition_id: instance.process_definition_id,
                    process_instance_id: instance.id.clone(),
                    business_key,
                    variables,
                    initiator: start_user_id,
                })?;
                self.report("process_run", run, |outcome| match outcome {
                    Ok(result) => render(&result),
                    Err(e) => json!({ "error": e.to_string() }),
                });
                to_reply(&instance)
            }

            Command::Suspend {
                process_instance_id,
            } => to_reply(
                &self
                    .lifecycle
                    .suspend_process_instance(&process_instance_id)
                    .await?,
            ),

            Command::Activate {
                process_instance_id,
            } => to_reply(
                &self
                    .lifecycle
                    .activate_process_instance(&process_instance_id)
                    .await?,
            ),

            Command::Terminate {
                process_instance_id,
                reason,
            } => to_reply(
                &self
                    .lifecycle
                    .terminate_process_instance(&process_instance_id, &reason)
                    .await?,
            ),

            Command::Signal {
                signal_name,
                process_instance_id,
                variables,
            } => {
                let event = self
                    .events
                    .send_signal(SignalEvent {
                        signal_name,
                        process_instance_id,
                        variables: variables::from_json_object(variables),
                        tenant_id: None,
                    })
                    .await?;
                to_reply(&event)
            }

            Command::Message {
                message_name,
                process_instance_id,
                correlation_keys,
                variables,
            } => {
                let event = self
                    .events
                    .send_message(MessageEvent {
                        message_name,
                        process_instance_id,
                        correlation_keys,
                        variables: variables::from_json_object(variables),
                        tenant_id: None,
                    })
                    .await?;
                to_reply(&event)
            }

            Command::CreateTask {
                task_id,
                process_instance_id,
                name,
                assignee,
            } => {
                let mut task = TaskInstance::new(task_id, process_instance_id, name);
                task.assignee = assignee.clone().filter(|a| !a.is_empty());
                let task = self.lifecycle.create_task(task).await?;

                let run = self.driver.start_task(TaskRunInput {
                    task_id: task.id.clone(),
                    assignee,
                    variables: task.variables.clone(),
                })?;
                self.report("task_run", run, |outcome| match outcome {
                    Ok(result) => render(&result),
                    Err(e) => json!({ "error": e.to_string() }),
                });
                to_reply(&task)
            }

            Command::ClaimTask { task_id, user_id } => {
                to_reply(&self.lifecycle.claim_task(&task_id, &user_id).await?)
            }

            Command::CompleteTask {
                task_id,
                user_id,
                variables,
            } => to_reply(
                &self
                    .lifecycle
                    .complete_task(&task_id, &user_id, variables::from_json_object(variables))
                    .await?,
            ),

            Command::DelegateTask {
                task_id,
                user_id,
                delegate_to,
            } => to_reply(
                &self
                    .lifecycle
                    .delegate_task(&task_id, &user_id, &delegate_to)
                    .await?,
            ),

            Command::RequestApproval {
                request_id,
                requestor,
                approvers,
                content,
                deadline_secs,
                require_all,
            } => {
                let run = self.approvals.start_approval(ApprovalRequest {
                    request_id: request_id.clone(),
                    requestor,
                    approvers,
                    content,
                    deadline: Duration::from_secs(deadline_secs),
                    require_all,
                })?;
                self.report("approval", run, |result| render(&result));
                Ok(json!({ "request_id": request_id }))
            }

            Command::Vote {
                request_id,
                approver,
                approved,
                comments,
            } => {
                let accepted = self.approvals.submit_vote(
                    &request_id,
                    ApprovalVote {
                        approver,
                        approved,
                        comments,
                    },
                )?;
                Ok(json!({ "accepted": accepted }))
            }

            Command::ScheduleTimer {
                timer_id,
                process_instance_id,
                delay_ms,
                repeat,
            } => {
                let due = chrono::Utc::now()
                    + chrono::Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX));
                let mut timer = TimerEvent::new(timer_id, process_instance_id, due);
                timer.repeat = repeat;
                self.events.schedule_timer(timer.clone()).await?;
                to_reply(&timer)
            }

            Command::CancelTimer { timer_id } => {
                self.events.cancel_timer(&timer_id).await?;
                Ok(json!({ "timer_id": timer_id }))
            }

            Command::Events {
                process_instance_id,
            } => to_reply(&self.events.get_process_events(&process_instance_id).await?),
        }
    }

    /// Forward the outcome of `run` to the report channel once it finishes.
    fn report<T, F>(&self, kind: &'static str, run: JoinHandle<T>, render: F)
    where
        T: Send + 'static,
        F: FnOnce(T) -> Value + Send + 'static,
    {
        let reports = self.reports.clone();
        let task = tokio::spawn(async move {
            let result = match run.await {
                Ok(outcome) => render(outcome),
                Err(e) => {
                    warn!(kind, error = %e, "Run task aborted");
                    json!({ "error": e.to_string() })
                }
            };
            let _ = reports.send(json!({ "report": kind, "result": result }));
        });

        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.retain(|handle| !handle.is_finished());
        pending.push(task);
    }

    /// Wait until every started run has sent its report.
    pub async fn finish(&self) {
        let pending = {
            let mut pending = match self.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *pending)
        };
        for task in pending {
            if let Err(e) = task.await {
                warn!(error = %e, "Report task failed");
            }
        }
    }
}

fn render<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({ "error": e.to_string() }))
}

fn to_reply<T: Serialize>(value: &T) -> OrchestrationResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| OrchestrationError::Transient(format!("unencodable reply: {}", e)))
}
