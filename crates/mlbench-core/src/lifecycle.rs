//! Run state machine. The only code that writes [`Run::state`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::run::{Run, RunId, RunState, Teardown, WorkerPoolHandle};

/// Event that may move a run between states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    ProvisionRequested,
    PoolReady,
    ProvisionTimeout { reason: String },
    ProvisionError { reason: String },
    CompletionSignal,
    WorkerLost { reason: String },
    CancelRequested,
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProvisionRequested => "provision_requested",
            Self::PoolReady => "pool_ready",
            Self::ProvisionTimeout { .. } => "provision_timeout",
            Self::ProvisionError { .. } => "provision_error",
            Self::CompletionSignal => "completion_signal",
            Self::WorkerLost { .. } => "worker_lost",
            Self::CancelRequested => "cancel_requested",
        }
    }

    fn reason(&self) -> Option<&str> {
        match self {
            Self::ProvisionTimeout { reason }
            | Self::ProvisionError { reason }
            | Self::WorkerLost { reason } => Some(reason),
            _ => None,
        }
    }
}

/// The transition table. `None` means the event is not legal from `from`.
pub fn next_state(from: RunState, event: &RunEvent) -> Option<RunState> {
    use RunState::*;
    match (from, event) {
        (Pending, RunEvent::ProvisionRequested) => Some(Provisioning),
        (Provisioning, RunEvent::PoolReady) => Some(Running),
        (Provisioning, RunEvent::ProvisionTimeout { .. })
        | (Provisioning, RunEvent::ProvisionError { .. }) => Some(Failed),
        (Running, RunEvent::CompletionSignal) => Some(Finished),
        (Running, RunEvent::WorkerLost { .. }) => Some(Failed),
        (Pending | Provisioning | Running, RunEvent::CancelRequested) => Some(Cancelled),
        _ => None,
    }
}

/// Outcome of a successful transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub run_id: RunId,
    pub from: RunState,
    pub to: RunState,
    /// Pool that must now be torn down, if any.
    pub teardown: Option<WorkerPoolHandle>,
}

impl Run {
    /// Apply `event`. On error the run is left untouched.
    pub fn apply(&mut self, event: RunEvent, now: DateTime<Utc>) -> Result<Transition> {
        let from = self.state;
        let to = next_state(from, &event).ok_or(Error::InvalidTransition {
            from,
            event: event.name(),
        })?;

        if matches!(event, RunEvent::ProvisionRequested) {
            self.resource_limits.validate()?;
        }

        self.state = to;
        self.updated_at = now;

        match to {
            RunState::Provisioning => {
                self.worker_pool_ref = Some(WorkerPoolHandle::for_run(self.id));
                self.provisioning_started_at = Some(now);
            }
            RunState::Running => {
                self.degraded_polls = 0;
            }
            RunState::Failed => {
                self.last_error = event.reason().map(str::to_string);
            }
            RunState::Finished | RunState::Cancelled => {
                self.worker_pool_ref = None;
            }
            RunState::Pending => {}
        }

        let mut teardown = None;
        if to.is_terminal() {
            self.finished_at = Some(now);
            if from != RunState::Pending {
                let handle = WorkerPoolHandle::for_run(self.id);
                self.teardown = Teardown::Pending {
                    handle: handle.clone(),
                    attempts: 0,
                    next_attempt_at: now,
                    in_flight: false,
                };
                teardown = Some(handle);
            }
        }

        Ok(Transition {
            run_id: self.id,
            from,
            to,
            teardown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ResourceLimits;
    use crate::run::NewRun;

    fn run_in(state: RunState) -> Run {
        let now = Utc::now();
        let mut run = Run::new(
            NewRun {
                id: None,
                name: "bench1".into(),
                worker_count: 4,
                resource_limits: ResourceLimits {
                    cpu_count: 2.0,
                    memory_mb: 4096,
                    bandwidth_mbit: 100,
                },
            },
            now,
        )
        .unwrap();
        let path: &[RunEvent] = match state {
            RunState::Pending => &[],
            RunState::Provisioning => &[RunEvent::ProvisionRequested],
            RunState::Running => &[RunEvent::ProvisionRequested, RunEvent::PoolReady],
            RunState::Failed => &[
                RunEvent::ProvisionRequested,
                RunEvent::ProvisionError {
                    reason: "boom".into(),
                },
            ],
            RunState::Finished => &[
                RunEvent::ProvisionRequested,
                RunEvent::PoolReady,
                RunEvent::CompletionSignal,
            ],
            RunState::Cancelled => &[RunEvent::CancelRequested],
        };
        for event in path {
            run.apply(event.clone(), now).unwrap();
        }
        assert_eq!(run.state, state);
        run
    }

    fn all_events() -> Vec<RunEvent> {
        vec![
            RunEvent::ProvisionRequested,
            RunEvent::PoolReady,
            RunEvent::ProvisionTimeout {
                reason: "t".into(),
            },
            RunEvent::ProvisionError {
                reason: "e".into(),
            },
            RunEvent::CompletionSignal,
            RunEvent::WorkerLost {
                reason: "l".into(),
            },
            RunEvent::CancelRequested,
        ]
    }

    #[test]
    fn test_illegal_transitions_leave_run_unchanged() {
        for state in RunState::ALL {
            for event in all_events() {
                let mut run = run_in(state);
                let before = run.clone();
                match next_state(state, &event) {
                    Some(to) => {
                        let t = run.apply(event, Utc::now()).unwrap();
                        assert_eq!(t.to, to);
                        assert_eq!(run.state, to);
                    }
                    None => {
                        let err = run.apply(event.clone(), Utc::now()).unwrap_err();
                        assert!(
                            matches!(err, Error::InvalidTransition { from, .. } if from == state),
                            "{state} + {}",
                            event.name()
                        );
                        assert_eq!(run, before);
                    }
                }
            }
        }
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for state in [RunState::Failed, RunState::Finished, RunState::Cancelled] {
            for event in all_events() {
                assert_eq!(next_state(state, &event), None);
            }
        }
    }

    #[test]
    fn test_pool_ref_invariant() {
        assert!(run_in(RunState::Pending).worker_pool_ref.is_none());
        assert!(run_in(RunState::Provisioning).worker_pool_ref.is_some());
        assert!(run_in(RunState::Running).worker_pool_ref.is_some());
        assert!(run_in(RunState::Failed).worker_pool_ref.is_some());
        assert!(run_in(RunState::Finished).worker_pool_ref.is_none());
        assert!(run_in(RunState::Cancelled).worker_pool_ref.is_none());
    }

    #[test]
    fn test_terminal_after_provisioning_schedules_teardown() {
        let mut run = run_in(RunState::Provisioning);
        let t = run
            .apply(RunEvent::CancelRequested, Utc::now())
            .unwrap();
        assert_eq!(t.teardown, Some(WorkerPoolHandle::for_run(run.id)));
        assert!(!run.resources_released());
        assert!(!run.is_deletable());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_cancel_from_pending_needs_no_teardown() {
        let mut run = run_in(RunState::Pending);
        let t = run
            .apply(RunEvent::CancelRequested, Utc::now())
            .unwrap();
        assert_eq!(t.to, RunState::Cancelled);
        assert!(t.teardown.is_none());
        assert!(run.is_deletable());
    }

    #[test]
    fn test_failure_records_last_error() {
        let mut run = run_in(RunState::Running);
        run.apply(
            RunEvent::WorkerLost {
                reason: "2/4 workers ready".into(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.last_error.as_deref(), Some("2/4 workers ready"));
    }

    #[test]
    fn test_provision_guard_rejects_invalid_limits() {
        let mut run = run_in(RunState::Pending);
        run.resource_limits.memory_mb = 0;
        let before = run.clone();
        let err = run
            .apply(RunEvent::ProvisionRequested, Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(run, before);
    }
}
