use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use uuid::Uuid;

use super::process_machine::{self, ProcessCommand};
use super::task_rules::{self, TaskCommand};
use super::types::*;
use crate::cache::{self, CacheRepository, CacheTtls};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::events::{
    EventCoordinator, ProcessEvent, EVENT_PROCESS_ACTIVATED, EVENT_PROCESS_STARTED,
    EVENT_PROCESS_SUSPENDED, EVENT_PROCESS_TERMINATED, EVENT_TASK_ASSIGNED, EVENT_TASK_COMPLETED,
    EVENT_TASK_CREATED,
};
use crate::orchestration::{RunRegistry, SignalHub, TASK_COMPLETE_SIGNAL};
use crate::store::Repositories;
use crate::variables::{self, VariableMap};

/// Per-id async locks, so read-modify-write commands on one instance run
/// one at a time.
#[derive(Default)]
struct InstanceLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstanceLocks {
    async fn acquire(&self, key: String) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !locks.contains_key(&key) {
                // Drop entries nobody holds or waits on.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Lifecycle operations on process and task instances.
///
/// The repositories are authoritative. The cache is read-through and is
/// invalidated after every write; cache trouble is logged, never returned.
/// Commands on the same instance or task are serialized, so a load, apply
/// and store never interleaves with another one on the same id.
#[derive(Clone)]
pub struct InstanceLifecycleService {
    repos: Repositories,
    cache: Arc<dyn CacheRepository>,
    ttls: CacheTtls,
    events: Option<EventCoordinator>,
    signals: Option<Arc<SignalHub>>,
    runs: Option<Arc<RunRegistry>>,
    locks: Arc<InstanceLocks>,
}

impl InstanceLifecycleService {
    pub fn new(repos: Repositories, cache: Arc<dyn CacheRepository>, ttls: CacheTtls) -> Self {
        Self {
            repos,
            cache,
            ttls,
            events: None,
            signals: None,
            runs: None,
            locks: Arc::new(InstanceLocks::default()),
        }
    }

    /// Record lifecycle events through `events`.
    pub fn with_events(mut self, events: EventCoordinator) -> Self {
        self.events = Some(events);
        self
    }

    /// Wake task runs waiting on `task_complete` when a task is completed.
    pub fn with_signals(mut self, signals: Arc<SignalHub>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Cancel the orchestration run of an instance when it is terminated.
    pub fn with_run_registry(mut self, runs: Arc<RunRegistry>) -> Self {
        self.runs = Some(runs);
        self
    }

    async fn emit(&self, event: ProcessEvent) {
        let Some(events) = &self.events else {
            return;
        };
        let event_type = event.event_type.clone();
        if let Err(e) = events.publish_event(event).await {
            warn!(event_type = %event_type, error = %e, "Failed to record lifecycle event");
        }
    }

    async fn lock_process(&self, id: &str) -> OwnedMutexGuard<()> {
        self.locks.acquire(format!("process:{}", id)).await
    }

    async fn lock_task(&self, id: &str) -> OwnedMutexGuard<()> {
        self.locks.acquire(format!("task:{}", id)).await
    }

    fn require_id(id: &str, what: &str) -> OrchestrationResult<()> {
        if id.is_empty() {
            return Err(OrchestrationError::validation(format!("{} is required", what)));
        }
        Ok(())
    }

    pub async fn start_process_instance(
        &self,
        request: StartProcessRequest,
    ) -> OrchestrationResult<ProcessInstance> {
        let definition = match (request.process_definition_id, &request.process_definition_key) {
            (Some(id), None) => self.repos.definitions.get_definition(id).await?,
            (None, Some(key)) if !key.is_empty() => {
                self.repos.definitions.latest_definition_by_key(key).await?
            }
            _ => {
                return Err(OrchestrationError::validation(
                    "exactly one of process definition id or key is required",
                ))
            }
        };
        if definition.suspended {
            return Err(OrchestrationError::invalid_state(format!(
                "process definition {} is suspended",
                definition.id
            )));
        }

        let instance = ProcessInstance {
            id: Uuid::new_v4().to_string(),
            process_definition_id: definition.id,
            process_definition_key: definition.key.clone(),
            process_definition_version: definition.version,
            business_key: request.business_key,
            name: request.name.or_else(|| Some(definition.name.clone())),
            start_user_id: request.start_user_id,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            suspended: false,
            delete_reason: None,
            tenant_id: request.tenant_id.or(definition.tenant_id),
            variables: request.variables,
        };
        self.repos.instances.create_instance(&instance).await?;

        if !instance.variables.is_empty() {
            let rows = variables::encode_map(&instance.variables);
            if let Err(e) = self
                .repos
                .variables
                .save_process_variables(&instance.id, rows)
                .await
            {
                warn!(process_instance_id = %instance.id, error = %e, "Failed to store process variables");
            }
        }

        cache::set_json(
            self.cache.as_ref(),
            &cache::process_instance_key(&instance.id),
            &instance,
            self.ttls.process_instance,
        )
        .await;

        let mut event = ProcessEvent::new(EVENT_PROCESS_STARTED, definition.key, instance.id.clone());
        event.user_id = instance.start_user_id.clone();
        event.tenant_id = instance.tenant_id.clone();
        self.emit(event).await;

        info!(
            process_instance_id = %instance.id,
            process_definition_id = instance.process_definition_id,
            "Started process instance"
        );
        Ok(instance)
    }

    pub async fn get_process_instance(&self, id: &str) -> OrchestrationResult<ProcessInstance> {
        Self::require_id(id, "process instance id")?;
        let key = cache::process_instance_key(id);
        if let Some(instance) = cache::get_json(self.cache.as_ref(), &key).await {
            return Ok(instance);
        }

        let instance = self.repos.instances.get_instance(id).await?;
        cache::set_json(self.cache.as_ref(), &key, &instance, self.ttls.process_instance).await;
        Ok(instance)
    }

    async fn apply_process_command(
        &self,
        id: &str,
        command: ProcessCommand,
    ) -> OrchestrationResult<ProcessInstance> {
        Self::require_id(id, "process instance id")?;
        let _guard = self.lock_process(id).await;
        let mut instance = self.repos.instances.get_instance(id).await?;
        process_machine::transition(&instance, &command)?;

        let event_type = match &command {
            ProcessCommand::Suspend => {
                instance.suspended = true;
                EVENT_PROCESS_SUSPENDED
            }
            ProcessCommand::Activate => {
                instance.suspended = false;
                EVENT_PROCESS_ACTIVATED
            }
            ProcessCommand::Terminate { reason } => {
                let now = Utc::now();
                if instance.start_time < now {
                    instance.duration_ms = Some((now - instance.start_time).num_milliseconds());
                }
                instance.end_time = Some(now);
                instance.suspended = false;
                instance.delete_reason = Some(reason.clone());
                EVENT_PROCESS_TERMINATED
            }
        };

        self.repos.instances.update_instance(&instance).await?;
        cache::invalidate(self.cache.as_ref(), &cache::process_instance_key(id)).await;

        let mut event = ProcessEvent::new(event_type, event_type, id);
        if let ProcessCommand::Terminate { reason } = &command {
            event.payload.insert("reason".to_string(), json!(reason));
        }
        self.emit(event).await;
        Ok(instance)
    }

    pub async fn suspend_process_instance(&self, id: &str) -> OrchestrationResult<ProcessInstance> {
        self.apply_process_command(id, ProcessCommand::Suspend).await
    }

    pub async fn activate_process_instance(&self, id: &str) -> OrchestrationResult<ProcessInstance> {
        self.apply_process_command(id, ProcessCommand::Activate).await
    }

    /// End an instance and stop any run waiting on it.
    pub async fn terminate_process_instance(
        &self,
        id: &str,
        reason: &str,
    ) -> OrchestrationResult<ProcessInstance> {
        let instance = self
            .apply_process_command(
                id,
                ProcessCommand::Terminate {
                    reason: reason.to_string(),
                },
            )
            .await?;

        if let Some(runs) = &self.runs {
            if runs.cancel(id) {
                info!(process_instance_id = %id, "Cancelled orchestration run of terminated instance");
            }
        }
        Ok(instance)
    }

    /// Terminate if still running, then remove the instance.
    pub async fn delete_process_instance(&self, id: &str, reason: &str) -> OrchestrationResult<()> {
        match self.terminate_process_instance(id, reason).await {
            Ok(_) | Err(OrchestrationError::InvalidState(_)) => {}
            Err(e) => return Err(e),
        }

        self.repos.instances.delete_instance(id).await?;
        cache::invalidate(self.cache.as_ref(), &cache::process_instance_key(id)).await;
        info!(process_instance_id = %id, reason = %reason, "Deleted process instance");
        Ok(())
    }

    pub async fn get_process_variables(&self, id: &str) -> OrchestrationResult<VariableMap> {
        Self::require_id(id, "process instance id")?;
        self.repos.instances.get_instance(id).await?;
        let rows = self.repos.variables.load_process_variables(id).await?;
        Ok(variables::decode_map(&rows))
    }

    /// Merge variables into a running instance.
    pub async fn set_process_variables(
        &self,
        id: &str,
        values: VariableMap,
    ) -> OrchestrationResult<()> {
        Self::require_id(id, "process instance id")?;
        let _guard = self.lock_process(id).await;
        let mut instance = self.repos.instances.get_instance(id).await?;
        if instance.is_ended() {
            return Err(OrchestrationError::invalid_state(format!(
                "process instance {} has ended",
                id
            )));
        }

        self.repos
            .variables
            .save_process_variables(id, variables::encode_map(&values))
            .await?;
        instance.variables.extend(values);
        self.repos.instances.update_instance(&instance).await?;
        cache::invalidate(self.cache.as_ref(), &cache::process_instance_key(id)).await;
        Ok(())
    }

    pub async fn create_task(&self, task: TaskInstance) -> OrchestrationResult<TaskInstance> {
        Self::require_id(&task.id, "task id")?;
        Self::require_id(&task.process_instance_id, "process instance id")?;
        self.repos.tasks.create_task(&task).await?;

        let mut event = ProcessEvent::new(
            EVENT_TASK_CREATED,
            task.name.clone(),
            task.process_instance_id.clone(),
        );
        event.activity_id = Some(task.task_definition_key.clone());
        event.payload.insert("task_id".to_string(), json!(task.id));
        self.emit(event).await;
        Ok(task)
    }

    pub async fn get_task_instance(&self, id: &str) -> OrchestrationResult<TaskInstance> {
        Self::require_id(id, "task id")?;
        let key = cache::task_instance_key(id);
        if let Some(task) = cache::get_json(self.cache.as_ref(), &key).await {
            return Ok(task);
        }

        let task = self.repos.tasks.get_task(id).await?;
        cache::set_json(self.cache.as_ref(), &key, &task, self.ttls.task_instance).await;
        Ok(task)
    }

    /// Load, apply and return the task. Callers hold the task lock until the
    /// result is stored.
    async fn apply_task_command(
        &self,
        id: &str,
        command: &TaskCommand,
    ) -> OrchestrationResult<TaskInstance> {
        let mut task = self.repos.tasks.get_task(id).await?;
        task_rules::apply(&mut task, command, Utc::now())?;
        Ok(task)
    }

    async fn store_task(&self, task: &TaskInstance) -> OrchestrationResult<()> {
        self.repos.tasks.update_task(task).await?;
        cache::invalidate(self.cache.as_ref(), &cache::task_instance_key(&task.id)).await;
        Ok(())
    }

    pub async fn claim_task(&self, id: &str, user_id: &str) -> OrchestrationResult<TaskInstance> {
        Self::require_id(id, "task id")?;
        let guard = self.lock_task(id).await;
        let task = self
            .apply_task_command(
                id,
                &TaskCommand::Claim {
                    user_id: user_id.to_string(),
                },
            )
            .await?;
        self.store_task(&task).await?;
        drop(guard);

        let mut event = ProcessEvent::new(
            EVENT_TASK_ASSIGNED,
            task.name.clone(),
            task.process_instance_id.clone(),
        );
        event.user_id = Some(user_id.to_string());
        event.payload.insert("task_id".to_string(), json!(task.id));
        self.emit(event).await;
        Ok(task)
    }

    /// Complete a claimed task, storing its output variables and waking any
    /// run waiting on it.
    pub async fn complete_task(
        &self,
        id: &str,
        user_id: &str,
        values: VariableMap,
    ) -> OrchestrationResult<TaskInstance> {
        Self::require_id(id, "task id")?;
        let guard = self.lock_task(id).await;
        let mut task = self
            .apply_task_command(
                id,
                &TaskCommand::Complete {
                    user_id: user_id.to_string(),
                },
            )
            .await?;

        let rows = variables::encode_map(&values);
        task.variables.extend(values);
        self.store_task(&task).await?;
        drop(guard);

        // The task row already carries its variables.
        if !rows.is_empty() {
            if let Err(e) = self.repos.variables.save_task_variables(id, rows).await {
                warn!(task_id = %id, error = %e, "Failed to store task variables");
            }
        }

        let output = serde_json::Value::Object(variables::to_json_object(&task.variables));
        if let Some(signals) = &self.signals {
            let payload = json!({ "completed_by": user_id, "variables": output });
            if let Err(e) = signals.signal(id, TASK_COMPLETE_SIGNAL, payload) {
                warn!(task_id = %id, error = %e, "Failed to signal task completion");
            }
        }

        let mut event = ProcessEvent::new(
            EVENT_TASK_COMPLETED,
            task.name.clone(),
            task.process_instance_id.clone(),
        );
        event.user_id = Some(user_id.to_string());
        event.payload.insert("task_id".to_string(), json!(task.id));
        event.payload.insert("variables".to_string(), output);
        self.emit(event).await;

        info!(task_id = %id, user_id = %user_id, "Completed task");
        Ok(task)
    }

    pub async fn delegate_task(
        &self,
        id: &str,
        user_id: &str,
        delegate_to: &str,
    ) -> OrchestrationResult<TaskInstance> {
        Self::require_id(id, "task id")?;
        let guard = self.lock_task(id).await;
        let task = self
            .apply_task_command(
                id,
                &TaskCommand::Delegate {
                    user_id: user_id.to_string(),
                    delegate_to: delegate_to.to_string(),
                },
            )
            .await?;
        self.store_task(&task).await?;
        drop(guard);

        let mut event = ProcessEvent::new(
            EVENT_TASK_ASSIGNED,
            task.name.clone(),
            task.process_instance_id.clone(),
        );
        event.user_id = Some(delegate_to.to_string());
        event.payload.insert("task_id".to_string(), json!(task.id));
        event.payload.insert("delegated_by".to_string(), json!(user_id));
        self.emit(event).await;
        Ok(task)
    }
}
