use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use super::notifier::{Notification, NotificationKind, Notifier};
use super::retry::retry_transient;
use super::signals::SignalHub;
use super::types::*;
use super::wait::{wait_point, LiveRun, RunRegistry, WaitOutcome};
use crate::config::OrchestrationConfig;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::observability::orchestration_metrics;
use crate::store::{RunKind, RunRecord, RunStatusRepository};
use crate::telemetry::{create_orchestration_span, generate_correlation_id, worker_identity};
use crate::variables;

/// Subscriptions a run holds while it is in flight.
struct RunGuard {
    run_id: String,
    channel: &'static str,
    signals: Arc<SignalHub>,
    registry: Arc<RunRegistry>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.signals.unregister(&self.run_id, self.channel);
        self.registry.unregister(&self.run_id);
    }
}

struct PreparedRun {
    guard: RunGuard,
    signals: mpsc::Receiver<serde_json::Value>,
    cancel: watch::Receiver<bool>,
    _live: LiveRun,
}

/// Sequences process and task runs:
/// validate, record `running`, notify, wait, record the outcome, notify.
#[derive(Clone)]
pub struct OrchestrationDriver {
    runs: Arc<dyn RunStatusRepository>,
    notifier: Arc<dyn Notifier>,
    signals: Arc<SignalHub>,
    registry: Arc<RunRegistry>,
    config: OrchestrationConfig,
}

impl OrchestrationDriver {
    pub fn new(
        runs: Arc<dyn RunStatusRepository>,
        notifier: Arc<dyn Notifier>,
        signals: Arc<SignalHub>,
        registry: Arc<RunRegistry>,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            runs,
            notifier,
            signals,
            registry,
            config,
        }
    }

    pub fn signals(&self) -> &Arc<SignalHub> {
        &self.signals
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn cancel_run(&self, run_id: &str) -> bool {
        self.registry.cancel(run_id)
    }

    fn prepare(
        &self,
        run_id: &str,
        channel: &'static str,
        correlation: Option<(String, String)>,
    ) -> OrchestrationResult<PreparedRun> {
        let (cancel, live) = self.registry.register(run_id)?;
        let keys = correlation.into_iter().collect();
        let signals = match self.signals.register_with_keys(run_id, channel, keys) {
            Ok(rx) => rx,
            Err(e) => {
                self.registry.unregister(run_id);
                return Err(e);
            }
        };

        Ok(PreparedRun {
            guard: RunGuard {
                run_id: run_id.to_string(),
                channel,
                signals: self.signals.clone(),
                registry: self.registry.clone(),
            },
            signals,
            cancel,
            _live: live,
        })
    }

    async fn record(
        &self,
        run_id: &str,
        kind: RunKind,
        status: RunStatus,
        detail: Option<serde_json::Value>,
    ) -> OrchestrationResult<()> {
        let record = RunRecord {
            run_id: run_id.to_string(),
            kind,
            status,
            worker: worker_identity(),
            updated_at: Utc::now(),
            detail,
        };
        retry_transient(&self.config.retry, "record_run_status", || async {
            self.runs.record_run(&record).await.map_err(OrchestrationError::from)
        })
        .await
    }

    async fn notify_best_effort(&self, notification: Notification) {
        let kind = notification.kind;
        if let Err(e) = self.notifier.notify(notification).await {
            orchestration_metrics().record_notification_failure();
            warn!(kind = ?kind, error = %e, "Notification failed");
        }
    }

    fn validate_process(input: &ProcessRunInput) -> Result<(), String> {
        if input.process_instance_id.is_empty() {
            return Err("process instance id is required".to_string());
        }
        if input.process_definition_id <= 0 {
            return Err("process definition id is required".to_string());
        }
        if !input.variables.contains_key(INITIATOR_VARIABLE) {
            return Err(format!("variable '{}' is required", INITIATOR_VARIABLE));
        }
        Ok(())
    }

    /// Validate and register a process run, then drive it on its own task.
    ///
    /// Registration happens before this returns, so a `complete` signal sent
    /// right after is not lost.
    pub fn start_process(
        &self,
        input: ProcessRunInput,
    ) -> OrchestrationResult<JoinHandle<OrchestrationResult<ProcessRunResult>>> {
        if let Err(reason) = Self::validate_process(&input) {
            let result = ProcessRunResult {
                process_instance_id: input.process_instance_id,
                status: RunStatus::Failed,
                result: json!({ "error": reason }),
                end_time: Utc::now(),
            };
            return Ok(tokio::spawn(async move { Ok(result) }));
        }

        let correlation = input
            .business_key
            .clone()
            .map(|bk| ("business_key".to_string(), bk));
        let prepared = self.prepare(&input.process_instance_id, PROCESS_COMPLETE_SIGNAL, correlation)?;
        let driver = self.clone();
        let span = create_orchestration_span(
            "process_run",
            Some(&input.process_instance_id),
            Some(&input.process_instance_id),
            Some(&generate_correlation_id()),
        );
        Ok(tokio::spawn(
            async move { driver.drive_process(input, prepared).await }.instrument(span),
        ))
    }

    /// Run a process to completion, timeout or cancellation.
    pub async fn run_process(&self, input: ProcessRunInput) -> OrchestrationResult<ProcessRunResult> {
        self.start_process(input)?
            .await
            .map_err(|e| OrchestrationError::Transient(format!("process run aborted: {}", e)))?
    }

    async fn drive_process(
        &self,
        input: ProcessRunInput,
        mut prepared: PreparedRun,
    ) -> OrchestrationResult<ProcessRunResult> {
        let run_id = input.process_instance_id.clone();
        orchestration_metrics().record_run_started();

        self.record(&run_id, RunKind::Process, RunStatus::Running, None)
            .await?;

        let initiator = input.initiator.clone().unwrap_or_else(|| {
            input
                .variables
                .get(INITIATOR_VARIABLE)
                .map(|v| match v.to_json() {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .unwrap_or_default()
        });

        let mut started = serde_json::Map::new();
        started.insert("process_definition_id".to_string(), input.process_definition_id.into());
        if let Some(bk) = &input.business_key {
            started.insert("business_key".to_string(), bk.clone().into());
        }
        started.insert(
            "variables".to_string(),
            serde_json::Value::Object(variables::to_json_object(&input.variables)),
        );
        self.notify_best_effort(Notification {
            kind: NotificationKind::ProcessStarted,
            recipient: initiator.clone(),
            subject_id: run_id.clone(),
            payload: started,
        })
        .await;

        let deadline = tokio::time::Instant::now() + self.config.process_deadline();
        info!(process_instance_id = %run_id, "Process run waiting for completion");
        let outcome = wait_point(&mut prepared.signals, deadline, &mut prepared.cancel).await;
        drop(prepared.guard);

        let (status, result) = match outcome {
            WaitOutcome::Signalled(payload) => (RunStatus::Completed, payload),
            WaitOutcome::DeadlineElapsed => {
                orchestration_metrics().record_run_timeout();
                (RunStatus::Timeout, serde_json::Value::Null)
            }
            WaitOutcome::Cancelled => (RunStatus::Cancelled, serde_json::Value::Null),
        };

        self.record(&run_id, RunKind::Process, status, Some(result.clone()))
            .await?;

        let mut completed = serde_json::Map::new();
        completed.insert("status".to_string(), status.as_str().into());
        completed.insert("result".to_string(), result.clone());
        self.notify_best_effort(Notification {
            kind: NotificationKind::ProcessCompleted,
            recipient: initiator,
            subject_id: run_id.clone(),
            payload: completed,
        })
        .await;

        info!(process_instance_id = %run_id, status = %status, "Process run finished");
        Ok(ProcessRunResult {
            process_instance_id: run_id,
            status,
            result,
            end_time: Utc::now(),
        })
    }

    /// Validate and register a task run, then drive it on its own task.
    pub fn start_task(
        &self,
        input: TaskRunInput,
    ) -> OrchestrationResult<JoinHandle<OrchestrationResult<TaskRunResult>>> {
        if input.task_id.is_empty() {
            let result = TaskRunResult {
                task_id: input.task_id,
                status: RunStatus::Failed,
                result: json!({ "error": "task id is required" }),
                completed: false,
            };
            return Ok(tokio::spawn(async move { Ok(result) }));
        }

        let prepared = self.prepare(&input.task_id, TASK_COMPLETE_SIGNAL, None)?;
        let driver = self.clone();
        let span = create_orchestration_span(
            "task_run",
            Some(&input.task_id),
            None,
            Some(&generate_correlation_id()),
        );
        Ok(tokio::spawn(
            async move { driver.drive_task(input, prepared).await }.instrument(span),
        ))
    }

    /// Run a task until `task_complete`, timeout or cancellation.
    pub async fn run_task(&self, input: TaskRunInput) -> OrchestrationResult<TaskRunResult> {
        self.start_task(input)?
            .await
            .map_err(|e| OrchestrationError::Transient(format!("task run aborted: {}", e)))?
    }

    async fn drive_task(
        &self,
        input: TaskRunInput,
        mut prepared: PreparedRun,
    ) -> OrchestrationResult<TaskRunResult> {
        let task_id = input.task_id.clone();
        orchestration_metrics().record_run_started();

        self.record(&task_id, RunKind::Task, RunStatus::Running, None)
            .await?;

        if let Some(assignee) = input.assignee.clone().filter(|a| !a.is_empty()) {
            let mut payload = serde_json::Map::new();
            payload.insert(
                "variables".to_string(),
                serde_json::Value::Object(variables::to_json_object(&input.variables)),
            );
            self.notify_best_effort(Notification {
                kind: NotificationKind::TaskAssigned,
                recipient: assignee,
                subject_id: task_id.clone(),
                payload,
            })
            .await;
        }

        let deadline = tokio::time::Instant::now() + self.config.task_deadline();
        let outcome = wait_point(&mut prepared.signals, deadline, &mut prepared.cancel).await;
        drop(prepared.guard);

        let (status, result) = match outcome {
            WaitOutcome::Signalled(payload) => (RunStatus::Completed, payload),
            WaitOutcome::DeadlineElapsed => {
                orchestration_metrics().record_run_timeout();
                (RunStatus::Timeout, serde_json::Value::Null)
            }
            WaitOutcome::Cancelled => (RunStatus::Cancelled, serde_json::Value::Null),
        };

        self.record(&task_id, RunKind::Task, status, Some(result.clone()))
            .await?;

        if status == RunStatus::Completed {
            let mut payload = serde_json::Map::new();
            payload.insert("result".to_string(), result.clone());
            self.notify_best_effort(Notification {
                kind: NotificationKind::TaskCompleted,
                recipient: input.assignee.clone().unwrap_or_default(),
                subject_id: task_id.clone(),
                payload,
            })
            .await;
        }

        info!(task_id = %task_id, status = %status, "Task run finished");
        Ok(TaskRunResult {
            task_id,
            completed: status == RunStatus::Completed,
            status,
            result,
        })
    }

    pub fn process_deadline(&self) -> Duration {
        self.config.process_deadline()
    }

    pub fn task_deadline(&self) -> Duration {
        self.config.task_deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowOrchestratorConfig;
    use crate::orchestration::LoggingNotifier;
    use crate::store::{InMemoryStore, MockRunStatusRepository, StoreError};
    use crate::variables::VariableValue;

    fn driver_with(runs: Arc<dyn RunStatusRepository>) -> OrchestrationDriver {
        let mut config = WorkflowOrchestratorConfig::default().orchestration;
        config.retry.jitter = false;
        OrchestrationDriver::new(
            runs,
            Arc::new(LoggingNotifier),
            Arc::new(SignalHub::new(8)),
            Arc::new(RunRegistry::new()),
            config,
        )
    }

    fn process_input(id: &str) -> ProcessRunInput {
        let mut input = ProcessRunInput {
            process_definition_id: 7,
            process_instance_id: id.to_string(),
            ..Default::default()
        };
        input.variables.insert(
            INITIATOR_VARIABLE.to_string(),
            VariableValue::String("alice".to_string()),
        );
        input
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_initiator_fails_without_side_effects() {
        let store = Arc::new(InMemoryStore::new());
        let driver = driver_with(store.clone());
        let mut input = process_input("pi-1");
        input.variables.clear();

        let result = driver.run_process(input).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(store.get_run("pi-1").await.is_err());
        assert!(driver.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_status_failure_aborts_run() {
        let mut runs = MockRunStatusRepository::new();
        runs.expect_record_run()
            .returning(|_| Err(StoreError::Backend("locked".to_string())));
        let driver = driver_with(Arc::new(runs));

        let err = driver.run_process(process_input("pi-1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(driver.registry().is_empty());
        assert!(!driver.signals().is_waiting("pi-1", PROCESS_COMPLETE_SIGNAL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_run_is_conflict() {
        let driver = driver_with(Arc::new(InMemoryStore::new()));
        let _first = driver.start_process(process_input("pi-1")).unwrap();
        assert!(matches!(
            driver.start_process(process_input("pi-1")),
            Err(OrchestrationError::Conflict(_))
        ));
    }
}
