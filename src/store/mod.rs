//! Repository abstractions
//!
//! The orchestration core never talks to a database directly. Durable state
//! sits behind these traits so that the in-memory store, the SQLite store
//! and test mocks are interchangeable.

pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::events::ProcessEvent;
use crate::lifecycle::{ProcessDefinition, ProcessInstance, TaskInstance};
use crate::orchestration::RunStatus;
use crate::variables::StoredVariable;

pub use memory::InMemoryStore;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} already exists: {id}")]
    Duplicate { entity: &'static str, id: String },
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Record serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Process,
    Task,
    Approval,
}

/// Durable status of one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub kind: RunKind,
    pub status: RunStatus,
    pub worker: String,
    pub updated_at: DateTime<Utc>,
    pub detail: Option<serde_json::Value>,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ProcessDefinitionRepository: Send + Sync {
    async fn get_definition(&self, id: i64) -> StoreResult<ProcessDefinition>;

    /// Highest version registered under the key.
    async fn latest_definition_by_key(&self, key: &str) -> StoreResult<ProcessDefinition>;

    async fn save_definition(&self, definition: &ProcessDefinition) -> StoreResult<()>;
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ProcessInstanceRepository: Send + Sync {
    async fn get_instance(&self, id: &str) -> StoreResult<ProcessInstance>;

    async fn create_instance(&self, instance: &ProcessInstance) -> StoreResult<()>;

    async fn update_instance(&self, instance: &ProcessInstance) -> StoreResult<()>;

    async fn delete_instance(&self, id: &str) -> StoreResult<()>;
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait TaskInstanceRepository: Send + Sync {
    async fn get_task(&self, id: &str) -> StoreResult<TaskInstance>;

    async fn create_task(&self, task: &TaskInstance) -> StoreResult<()>;

    async fn update_task(&self, task: &TaskInstance) -> StoreResult<()>;

    async fn list_tasks_for_process(&self, process_instance_id: &str)
        -> StoreResult<Vec<TaskInstance>>;
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ProcessEventRepository: Send + Sync {
    async fn append_event(&self, event: &ProcessEvent) -> StoreResult<()>;

    async fn get_event(&self, id: &str) -> StoreResult<ProcessEvent>;

    /// Events for an instance ordered by timestamp.
    async fn list_events(&self, process_instance_id: &str) -> StoreResult<Vec<ProcessEvent>>;
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait VariableRepository: Send + Sync {
    /// Upsert by variable name.
    async fn save_process_variables(
        &self,
        process_instance_id: &str,
        rows: Vec<StoredVariable>,
    ) -> StoreResult<()>;

    async fn load_process_variables(
        &self,
        process_instance_id: &str,
    ) -> StoreResult<Vec<StoredVariable>>;

    async fn save_task_variables(&self, task_id: &str, rows: Vec<StoredVariable>)
        -> StoreResult<()>;
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait RunStatusRepository: Send + Sync {
    async fn record_run(&self, record: &RunRecord) -> StoreResult<()>;

    async fn get_run(&self, run_id: &str) -> StoreResult<RunRecord>;
}

/// Handles to every repository the core needs.
#[derive(Clone)]
pub struct Repositories {
    pub definitions: Arc<dyn ProcessDefinitionRepository>,
    pub instances: Arc<dyn ProcessInstanceRepository>,
    pub tasks: Arc<dyn TaskInstanceRepository>,
    pub events: Arc<dyn ProcessEventRepository>,
    pub variables: Arc<dyn VariableRepository>,
    pub runs: Arc<dyn RunStatusRepository>,
}

impl Repositories {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ProcessDefinitionRepository
            + ProcessInstanceRepository
            + TaskInstanceRepository
            + ProcessEventRepository
            + VariableRepository
            + RunStatusRepository
            + 'static,
    {
        Self {
            definitions: store.clone(),
            instances: store.clone(),
            tasks: store.clone(),
            events: store.clone(),
            variables: store.clone(),
            runs: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_store(Arc::new(InMemoryStore::new()))
    }
}
