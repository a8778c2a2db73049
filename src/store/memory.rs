use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{
    ProcessDefinitionRepository, ProcessEventRepository, ProcessInstanceRepository, RunRecord,
    RunStatusRepository, StoreError, StoreResult, TaskInstanceRepository, VariableRepository,
};
use crate::events::ProcessEvent;
use crate::lifecycle::{ProcessDefinition, ProcessInstance, TaskInstance};
use crate::variables::StoredVariable;

/// Process-local store used by the CLI and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    definitions: RwLock<HashMap<i64, ProcessDefinition>>,
    instances: RwLock<HashMap<String, ProcessInstance>>,
    tasks: RwLock<HashMap<String, TaskInstance>>,
    events: RwLock<Vec<ProcessEvent>>,
    process_variables: RwLock<HashMap<String, HashMap<String, StoredVariable>>>,
    task_variables: RwLock<HashMap<String, HashMap<String, StoredVariable>>>,
    runs: RwLock<HashMap<String, RunRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessDefinitionRepository for InMemoryStore {
    async fn get_definition(&self, id: i64) -> StoreResult<ProcessDefinition> {
        self.definitions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("process definition", id.to_string()))
    }

    async fn latest_definition_by_key(&self, key: &str) -> StoreResult<ProcessDefinition> {
        self.definitions
            .read()
            .await
            .values()
            .filter(|d| d.key == key)
            .max_by_key(|d| d.version)
            .cloned()
            .ok_or_else(|| StoreError::not_found("process definition", key))
    }

    async fn save_definition(&self, definition: &ProcessDefinition) -> StoreResult<()> {
        self.definitions
            .write()
            .await
            .insert(definition.id, definition.clone());
        Ok(())
    }
}

#[async_trait]
impl ProcessInstanceRepository for InMemoryStore {
    async fn get_instance(&self, id: &str) -> StoreResult<ProcessInstance> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("process instance", id))
    }

    async fn create_instance(&self, instance: &ProcessInstance) -> StoreResult<()> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id) {
            return Err(StoreError::Duplicate {
                entity: "process instance",
                id: instance.id.clone(),
            });
        }
        instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn update_instance(&self, instance: &ProcessInstance) -> StoreResult<()> {
        let mut instances = self.instances.write().await;
        match instances.get_mut(&instance.id) {
            Some(existing) => {
                *existing = instance.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("process instance", &instance.id)),
        }
    }

    async fn delete_instance(&self, id: &str) -> StoreResult<()> {
        self.instances
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("process instance", id))
    }
}

#[async_trait]
impl TaskInstanceRepository for InMemoryStore {
    async fn get_task(&self, id: &str) -> StoreResult<TaskInstance> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task instance", id))
    }

    async fn create_task(&self, task: &TaskInstance) -> StoreResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate {
                entity: "task instance",
                id: task.id.clone(),
            });
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &TaskInstance) -> StoreResult<()> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("task instance", &task.id)),
        }
    }

    async fn list_tasks_for_process(
        &self,
        process_instance_id: &str,
    ) -> StoreResult<Vec<TaskInstance>> {
        let mut tasks: Vec<TaskInstance> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.process_instance_id == process_instance_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.create_time);
        Ok(tasks)
    }
}

#[async_trait]
impl ProcessEventRepository for InMemoryStore {
    async fn append_event(&self, event: &ProcessEvent) -> StoreResult<()> {
        let mut events = self.events.write().await;
        if events.iter().any(|e| e.id == event.id) {
            return Err(StoreError::Duplicate {
                entity: "process event",
                id: event.id.clone(),
            });
        }
        events.push(event.clone());
        Ok(())
    }

    async fn get_event(&self, id: &str) -> StoreResult<ProcessEvent> {
        self.events
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("process event", id))
    }

    async fn list_events(&self, process_instance_id: &str) -> StoreResult<Vec<ProcessEvent>> {
        let mut events: Vec<ProcessEvent> = self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.process_instance_id == process_instance_id)
            .cloned()
            .collect();
        // stable sort keeps append order for equal timestamps
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

#[async_trait]
impl VariableRepository for InMemoryStore {
    async fn save_process_variables(
        &self,
        process_instance_id: &str,
        rows: Vec<StoredVariable>,
    ) -> StoreResult<()> {
        let mut all = self.process_variables.write().await;
        let entry = all.entry(process_instance_id.to_string()).or_default();
        for row in rows {
            entry.insert(row.name.clone(), row);
        }
        Ok(())
    }

    async fn load_process_variables(
        &self,
        process_instance_id: &str,
    ) -> StoreResult<Vec<StoredVariable>> {
        let all = self.process_variables.read().await;
        let mut rows: Vec<StoredVariable> = all
            .get(process_instance_id)
            .map(|vars| vars.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn save_task_variables(
        &self,
        task_id: &str,
        rows: Vec<StoredVariable>,
    ) -> StoreResult<()> {
        let mut all = self.task_variables.write().await;
        let entry = all.entry(task_id.to_string()).or_default();
        for row in rows {
            entry.insert(row.name.clone(), row);
        }
        Ok(())
    }
}

#[async_trait]
impl RunStatusRepository for InMemoryStore {
    async fn record_run(&self, record: &RunRecord) -> StoreResult<()> {
        self.runs
            .write()
            .await
            .insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<RunRecord> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("run", run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn definition(id: i64, key: &str, version: i32) -> ProcessDefinition {
        ProcessDefinition {
            id,
            key: key.to_string(),
            name: key.to_string(),
            version,
            suspended: false,
            tenant_id: None,
        }
    }

    #[tokio::test]
    async fn test_latest_definition_picks_highest_version() {
        let store = InMemoryStore::new();
        store.save_definition(&definition(1, "leave", 1)).await.unwrap();
        store.save_definition(&definition(2, "leave", 3)).await.unwrap();
        store.save_definition(&definition(3, "expense", 7)).await.unwrap();

        let latest = store.latest_definition_by_key("leave").await.unwrap();
        assert_eq!(latest.id, 2);
        assert!(store.latest_definition_by_key("travel").await.is_err());
    }

    #[tokio::test]
    async fn test_events_listed_in_timestamp_order() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for (id, offset) in [("e1", 5), ("e2", 1), ("e3", 3)] {
            let mut event = ProcessEvent::new("signal", id, "pi-1");
            event.id = id.to_string();
            event.timestamp = Some(now + Duration::seconds(offset));
            store.append_event(&event).await.unwrap();
        }

        let ids: Vec<String> = store
            .list_events("pi-1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["e2", "e3", "e1"]);
    }

    #[tokio::test]
    async fn test_delete_missing_instance_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.delete_instance("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
