//! Process and task instance lifecycles
//!
//! `process_machine` and `task_rules` decide which transitions are legal;
//! `InstanceLifecycleService` loads, applies and persists them.

mod process_machine;
mod service;
mod task_rules;
mod types;

pub use process_machine::{transition, ProcessCommand, ProcessLifecycle, ProcessPhase};
pub use service::InstanceLifecycleService;
pub use task_rules::{apply as apply_task_command, TaskCommand, TaskPhase};
pub use types::*;
