//! Event, signal and timer coordination

mod coordinator;
mod listeners;
mod repeat;
mod timers;
mod types;

pub use coordinator::{EventCoordinator, MessageCorrelator};
pub use listeners::{EventListener, ListenerRegistry};
pub use repeat::RepeatRule;
pub use timers::{FireDecision, TimerScheduler};
pub use types::*;
