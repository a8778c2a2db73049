//! Long-running orchestration runs: process and task runs that wait for a
//! completion signal, and multi-party approvals.
//!
//! Every run is its own tokio task with a single wait point where a signal
//! channel races a deadline and a cancellation handle.

mod approval;
mod driver;
mod notifier;
mod retry;
mod signals;
mod types;
mod wait;

pub use approval::ApprovalAggregator;
pub use driver::OrchestrationDriver;
pub use notifier::{
    EventNotifier, LoggingNotifier, Notification, NotificationKind, Notifier, NotifyError,
    RateLimitedNotifier,
};
pub use retry::{backoff_delay, retry_transient};
pub use signals::{SignalBridge, SignalHub};
pub use types::*;
pub use wait::{wait_point, LiveRun, RunRegistry, WaitOutcome};
