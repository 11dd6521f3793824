//! Run model: the authoritative record of one benchmark execution.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::limits::ResourceLimits;

/// Unique identifier for a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::NotFound(format!("run {s}")))
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Provisioning,
    Running,
    Failed,
    Finished,
    Cancelled,
}

impl RunState {
    pub const ALL: [RunState; 6] = [
        RunState::Pending,
        RunState::Provisioning,
        RunState::Running,
        RunState::Failed,
        RunState::Finished,
        RunState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Finished | Self::Cancelled)
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Finished => write!(f, "finished"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Opaque reference to a run's worker pool.
///
/// The group name is derived from the run id, so a handle can be rebuilt
/// after a restart without asking the cluster manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerPoolHandle {
    pub run_id: RunId,
    pub group: String,
}

impl WorkerPoolHandle {
    pub fn for_run(run_id: RunId) -> Self {
        Self {
            run_id,
            group: format!("mlbench-{}", run_id.0.simple()),
        }
    }
}

/// Cleanup progress of a run's pool once the run is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Teardown {
    /// No pool was ever requested.
    NotRequired,
    Pending {
        handle: WorkerPoolHandle,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        #[serde(skip)]
        in_flight: bool,
    },
    Released { at: DateTime<Utc> },
}

/// Request to create a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRun {
    /// Explicit identifier; generated when absent.
    #[serde(default)]
    pub id: Option<RunId>,
    pub name: String,
    pub worker_count: u32,
    pub resource_limits: ResourceLimits,
}

impl NewRun {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("name must not be empty".into()));
        }
        if self.worker_count < 1 {
            return Err(Error::Validation("worker_count must be at least 1".into()));
        }
        self.resource_limits.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub name: String,
    pub desired_worker_count: u32,
    pub resource_limits: ResourceLimits,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pool_ref: Option<WorkerPoolHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub teardown: Teardown,
    /// Consecutive running-state polls that saw fewer ready workers than desired.
    #[serde(default)]
    pub degraded_polls: u32,
}

impl Run {
    /// Build a `pending` run from a validated request.
    pub fn new(spec: NewRun, now: DateTime<Utc>) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            id: spec.id.unwrap_or_default(),
            name: spec.name.trim().to_string(),
            desired_worker_count: spec.worker_count,
            resource_limits: spec.resource_limits,
            state: RunState::Pending,
            created_at: now,
            updated_at: now,
            provisioning_started_at: None,
            finished_at: None,
            worker_pool_ref: None,
            last_error: None,
            teardown: Teardown::NotRequired,
            degraded_polls: 0,
        })
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
        }
    }

    /// Terminal and holding no cluster resources.
    pub fn is_deletable(&self) -> bool {
        self.state.is_terminal() && !matches!(self.teardown, Teardown::Pending { .. })
    }

    pub fn resources_released(&self) -> bool {
        !matches!(self.teardown, Teardown::Pending { .. })
    }

    /// Handle of a teardown that is due and not already being attempted.
    pub fn teardown_due(&self, now: DateTime<Utc>) -> Option<WorkerPoolHandle> {
        match &self.teardown {
            Teardown::Pending {
                handle,
                next_attempt_at,
                in_flight: false,
                ..
            } if *next_attempt_at <= now => Some(handle.clone()),
            _ => None,
        }
    }

    /// Claim the pending teardown for one attempt. Returns `None` if another attempt holds it.
    pub fn begin_teardown_attempt(&mut self) -> Option<WorkerPoolHandle> {
        match &mut self.teardown {
            Teardown::Pending {
                handle, in_flight, ..
            } if !*in_flight => {
                *in_flight = true;
                Some(handle.clone())
            }
            _ => None,
        }
    }

    pub fn mark_teardown_released(&mut self, now: DateTime<Utc>) {
        if matches!(self.teardown, Teardown::Pending { .. }) {
            self.teardown = Teardown::Released { at: now };
            self.updated_at = now;
        }
    }

    /// Release the claim and schedule the next attempt after `delay`.
    pub fn reschedule_teardown(&mut self, now: DateTime<Utc>, delay: Duration) {
        if let Teardown::Pending {
            attempts,
            next_attempt_at,
            in_flight,
            ..
        } = &mut self.teardown
        {
            *attempts += 1;
            *next_attempt_at = now + delay;
            *in_flight = false;
        }
    }

    pub fn teardown_attempts(&self) -> u32 {
        match &self.teardown {
            Teardown::Pending { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

/// Row returned by run listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub name: String,
    pub state: RunState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> NewRun {
        NewRun {
            id: None,
            name: "bench1".into(),
            worker_count: 4,
            resource_limits: ResourceLimits {
                cpu_count: 2.0,
                memory_mb: 4096,
                bandwidth_mbit: 100,
            },
        }
    }

    #[test]
    fn test_new_run_is_pending() {
        let run = Run::new(spec(), Utc::now()).unwrap();
        assert_eq!(run.state, RunState::Pending);
        assert!(run.worker_pool_ref.is_none());
        assert_eq!(run.teardown, Teardown::NotRequired);
        assert!(run.resources_released());
    }

    #[test]
    fn test_new_run_validation() {
        let mut zero_workers = spec();
        zero_workers.worker_count = 0;
        assert!(matches!(
            Run::new(zero_workers, Utc::now()),
            Err(Error::Validation(_))
        ));

        let mut blank_name = spec();
        blank_name.name = "   ".into();
        assert!(matches!(
            Run::new(blank_name, Utc::now()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_handle_is_derived_from_run_id() {
        let id = RunId::new();
        let a = WorkerPoolHandle::for_run(id);
        let b = WorkerPoolHandle::for_run(id);
        assert_eq!(a, b);
        assert!(a.group.starts_with("mlbench-"));
        assert!(a.group.len() <= 63);
    }

    #[test]
    fn test_run_id_parse() {
        let id = RunId::new();
        assert_eq!(id.to_string().parse::<RunId>().unwrap(), id);
        assert!(matches!("nope".parse::<RunId>(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_teardown_claim_and_reschedule() {
        let now = Utc::now();
        let mut run = Run::new(spec(), now).unwrap();
        run.teardown = Teardown::Pending {
            handle: WorkerPoolHandle::for_run(run.id),
            attempts: 0,
            next_attempt_at: now,
            in_flight: false,
        };

        assert!(run.teardown_due(now).is_some());
        assert!(run.begin_teardown_attempt().is_some());
        assert!(run.begin_teardown_attempt().is_none());
        assert!(run.teardown_due(now).is_none());

        run.reschedule_teardown(now, Duration::seconds(4));
        assert_eq!(run.teardown_attempts(), 1);
        assert!(run.teardown_due(now).is_none());
        assert!(run.teardown_due(now + Duration::seconds(4)).is_some());

        run.mark_teardown_released(now);
        assert!(run.resources_released());
        assert!(run.teardown_due(now + Duration::days(1)).is_none());
    }

    #[test]
    fn test_in_flight_flag_not_persisted() {
        let now = Utc::now();
        let teardown = Teardown::Pending {
            handle: WorkerPoolHandle::for_run(RunId::new()),
            attempts: 2,
            next_attempt_at: now,
            in_flight: true,
        };
        let json = serde_json::to_value(&teardown).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("in_flight").is_none());

        let restored: Teardown = serde_json::from_value(json).unwrap();
        assert!(matches!(
            restored,
            Teardown::Pending {
                in_flight: false,
                attempts: 2,
                ..
            }
        ));
    }
}
