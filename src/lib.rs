// Workflow Orchestrator Library - asynchronous orchestration core
// This exposes the core components for embedding and integration tests

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod intake;
pub mod lifecycle;
pub mod observability;
pub mod orchestration;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod variables;

// Re-export key types for easy access
pub use cache::{CacheRepository, CacheTtls, MokaCache};
pub use config::{config, init_config, WorkflowOrchestratorConfig};
pub use database::init_repositories;
pub use error::{ErrorKind, OrchestrationError, OrchestrationResult};
pub use events::{EventCoordinator, EventListener, ProcessEvent, TimerEvent};
pub use intake::{Command, Intake};
pub use lifecycle::{InstanceLifecycleService, ProcessInstance, TaskInstance};
pub use observability::{orchestration_metrics, OperationTimer, OrchestrationMetrics};
pub use orchestration::{
    ApprovalAggregator, ApprovalRequest, ApprovalStatus, ApprovalVote, ApprovalWorkflowResult,
    OrchestrationDriver, RunRegistry, RunStatus, SignalBridge, SignalHub,
};
pub use shutdown::ShutdownCoordinator;
pub use store::{InMemoryStore, Repositories};
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use variables::{VariableMap, VariableValue};
