use serde::{Deserialize, Serialize};
use statig::prelude::*;
use std::cell::Cell;

use crate::error::OrchestrationError;
use crate::lifecycle::ProcessInstance;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessCommand {
    Suspend,
    Activate,
    Terminate { reason: String },
}

impl ProcessCommand {
    fn name(&self) -> &'static str {
        match self {
            ProcessCommand::Suspend => "suspend",
            ProcessCommand::Activate => "activate",
            ProcessCommand::Terminate { .. } => "terminate",
        }
    }
}

/// Lifecycle phase of a process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessPhase {
    Active,
    Suspended,
    Ended,
}

impl ProcessPhase {
    pub fn of(instance: &ProcessInstance) -> Self {
        if instance.is_ended() {
            ProcessPhase::Ended
        } else if instance.suspended {
            ProcessPhase::Suspended
        } else {
            ProcessPhase::Active
        }
    }
}

#[derive(Default)]
pub struct ProcessLifecycle {
    pub process_instance_id: String,
    /// While set, transitions restore a stored phase and are not logged.
    restoring: Cell<bool>,
}

impl ProcessLifecycle {
    pub fn new(process_instance_id: String) -> Self {
        Self {
            process_instance_id,
            restoring: Cell::new(false),
        }
    }

    fn restoring(process_instance_id: String) -> Self {
        Self {
            process_instance_id,
            restoring: Cell::new(true),
        }
    }

    fn log_transition(&self, message: &str, reason: Option<&str>) {
        if self.restoring.get() {
            return;
        }
        match reason {
            Some(reason) => tracing::info!(
                process_instance_id = %self.process_instance_id,
                reason = %reason,
                "{}",
                message
            ),
            None => tracing::info!(process_instance_id = %self.process_instance_id, "{}", message),
        }
    }
}

#[state_machine(initial = "State::active()")]
impl ProcessLifecycle {
    #[state]
    fn active(&mut self, event: &ProcessCommand) -> Outcome<State> {
        match event {
            ProcessCommand::Suspend => {
                self.log_transition("Process instance suspended", None);
                Transition(State::suspended())
            }
            ProcessCommand::Terminate { reason } => {
                self.log_transition("Process instance terminated", Some(reason));
                Transition(State::ended())
            }
            ProcessCommand::Activate => Handled,
        }
    }

    #[state]
    fn suspended(&mut self, event: &ProcessCommand) -> Outcome<State> {
        match event {
            ProcessCommand::Activate => {
                self.log_transition("Process instance activated", None);
                Transition(State::active())
            }
            ProcessCommand::Terminate { reason } => {
                self.log_transition("Suspended process instance terminated", Some(reason));
                Transition(State::ended())
            }
            ProcessCommand::Suspend => Handled,
        }
    }

    #[state]
    fn ended(&mut self, event: &ProcessCommand) -> Outcome<State> {
        tracing::debug!(
            process_instance_id = %self.process_instance_id,
            event = event.name(),
            "Ignoring event for ended process instance"
        );
        Handled
    }
}

fn phase_of(state: &State) -> ProcessPhase {
    match state {
        State::Active { .. } => ProcessPhase::Active,
        State::Suspended { .. } => ProcessPhase::Suspended,
        State::Ended { .. } => ProcessPhase::Ended,
    }
}

/// Drive the lifecycle machine for a stored instance.
///
/// The machine is rebuilt from the stored flags without logging, the event
/// applied, and the resulting phase returned. An event that does not move the machine is an
/// invalid transition.
pub fn transition(
    instance: &ProcessInstance,
    event: &ProcessCommand,
) -> Result<ProcessPhase, OrchestrationError> {
    let mut sm = ProcessLifecycle::restoring(instance.id.clone()).state_machine();

    match ProcessPhase::of(instance) {
        ProcessPhase::Active => {}
        ProcessPhase::Suspended => sm.handle(&ProcessCommand::Suspend),
        ProcessPhase::Ended => sm.handle(&ProcessCommand::Terminate {
            reason: instance.delete_reason.clone().unwrap_or_default(),
        }),
    }

    let before = phase_of(sm.state());
    sm.inner().restoring.set(false);
    sm.handle(event);
    let after = phase_of(sm.state());

    if before == after {
        let detail = match (before, event) {
            (ProcessPhase::Ended, _) => "process instance has already ended",
            (ProcessPhase::Suspended, ProcessCommand::Suspend) => {
                "process instance is already suspended"
            }
            (ProcessPhase::Active, ProcessCommand::Activate) => "process instance is already active",
            _ => "transition not allowed",
        };
        return Err(OrchestrationError::invalid_state(format!(
            "cannot {} {}: {}",
            event.name(),
            instance.id,
            detail
        )));
    }

    Ok(after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_subscriber::layer::{Context, SubscriberExt};

    /// Counts info-level events.
    struct InfoCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for InfoCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::INFO {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn info_lines(f: impl FnOnce()) -> usize {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(InfoCounter(count.clone()));
        tracing::subscriber::with_default(subscriber, f);
        count.load(Ordering::SeqCst)
    }

    fn instance() -> ProcessInstance {
        ProcessInstance {
            id: "pi-1".to_string(),
            process_definition_id: 1,
            process_definition_key: "leave".to_string(),
            process_definition_version: 1,
            business_key: None,
            name: None,
            start_user_id: None,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            suspended: false,
            delete_reason: None,
            tenant_id: None,
            variables: Default::default(),
        }
    }

    #[test]
    fn test_suspend_then_activate() {
        let mut pi = instance();
        assert_eq!(
            transition(&pi, &ProcessCommand::Suspend).unwrap(),
            ProcessPhase::Suspended
        );
        pi.suspended = true;
        assert_eq!(
            transition(&pi, &ProcessCommand::Activate).unwrap(),
            ProcessPhase::Active
        );
    }

    #[test]
    fn test_double_suspend_is_invalid() {
        let mut pi = instance();
        pi.suspended = true;
        let err = transition(&pi, &ProcessCommand::Suspend).unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidState(_)));
    }

    #[test]
    fn test_terminate_allowed_while_suspended() {
        let mut pi = instance();
        pi.suspended = true;
        let phase = transition(
            &pi,
            &ProcessCommand::Terminate {
                reason: "cleanup".to_string(),
            },
        )
        .unwrap();
        assert_eq!(phase, ProcessPhase::Ended);
    }

    #[test]
    fn test_ended_instance_rejects_everything() {
        let mut pi = instance();
        pi.end_time = Some(Utc::now());
        for event in [
            ProcessCommand::Suspend,
            ProcessCommand::Activate,
            ProcessCommand::Terminate {
                reason: "again".to_string(),
            },
        ] {
            assert!(matches!(
                transition(&pi, &event),
                Err(OrchestrationError::InvalidState(_))
            ));
        }
    }

    #[test]
    fn test_restoring_stored_phase_is_not_logged() {
        let mut pi = instance();
        pi.suspended = true;
        let logged = info_lines(|| {
            transition(&pi, &ProcessCommand::Activate).unwrap();
        });
        assert_eq!(logged, 1);

        pi.end_time = Some(Utc::now());
        let logged = info_lines(|| {
            assert!(transition(&pi, &ProcessCommand::Suspend).is_err());
        });
        assert_eq!(logged, 0);
    }
}
