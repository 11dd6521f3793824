//! Wire types exchanged with the cluster manager.

use std::collections::BTreeMap;

use mlbench_core::{ResourceDeclaration, RunId};
use serde::{Deserialize, Serialize};

/// Request to materialize one run's workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerGroupSpec {
    pub name: String,
    pub run_id: RunId,
    pub count: u32,
    pub declaration: ResourceDeclaration,
    /// Secret holding the SSH key pair, mounted into every worker.
    pub secret_ref: String,
    /// Internal port each worker listens on for inter-worker SSH.
    pub ssh_port: u16,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl WorkerGroupSpec {
    pub fn worker_name(group: &str, index: u32) -> String {
        format!("{group}-worker-{index}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    Pending,
    Running,
    Failed,
}

/// Observed state of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub phase: WorkerPhase,
    /// Whether the worker's SSH port accepted a connection on the last probe.
    #[serde(default)]
    pub ssh_reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerStatus {
    pub fn is_ready(&self) -> bool {
        self.phase == WorkerPhase::Running && self.ssh_reachable
    }
}

/// Status as reported by the cluster manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub ready_count: u32,
    pub total_count: u32,
    #[serde(default)]
    pub workers: Vec<WorkerStatus>,
}

/// Readiness snapshot of a pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub count_ready: u32,
    pub count_total: u32,
    pub errors: Vec<String>,
    pub workers: Vec<WorkerStatus>,
    /// The cluster manager does not know the pool's worker group.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub group_missing: bool,
}

impl PoolStatus {
    /// Readiness is judged from the per-worker detail rather than the
    /// collaborator's aggregate counters, since reachability is per worker.
    pub fn from_group(status: GroupStatus) -> Self {
        let (count_ready, count_total) = if status.workers.is_empty() {
            (status.ready_count, status.total_count)
        } else {
            (
                status.workers.iter().filter(|w| w.is_ready()).count() as u32,
                status.workers.len() as u32,
            )
        };
        let errors = status
            .workers
            .iter()
            .filter_map(|w| w.error.as_ref().map(|e| format!("{}: {}", w.name, e)))
            .collect();

        Self {
            count_ready,
            count_total,
            errors,
            workers: status.workers,
            group_missing: false,
        }
    }

    /// Exactly `desired` workers exist and all of them are ready.
    pub fn is_ready(&self, desired: u32) -> bool {
        self.count_total == desired && self.count_ready == desired
    }

    /// Fewer than `desired` workers are ready. Surplus replicas are ignored.
    pub fn is_degraded(&self, desired: u32) -> bool {
        self.count_ready < desired
    }

    /// Names of the workers that are not ready. Missing replicas are named
    /// by the index they would have had.
    pub fn unready_workers(&self, group: &str, desired: u32) -> Vec<String> {
        let mut names: Vec<String> = self
            .workers
            .iter()
            .filter(|w| !w.is_ready())
            .map(|w| w.name.clone())
            .collect();
        for index in 0..desired {
            let name = WorkerGroupSpec::worker_name(group, index);
            if !self.workers.iter().any(|w| w.name == name) && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str, phase: WorkerPhase, ssh: bool) -> WorkerStatus {
        WorkerStatus {
            name: name.into(),
            address: None,
            phase,
            ssh_reachable: ssh,
            error: None,
        }
    }

    #[test]
    fn test_running_without_ssh_is_not_ready() {
        let status = PoolStatus::from_group(GroupStatus {
            ready_count: 2,
            total_count: 2,
            workers: vec![
                worker("g-worker-0", WorkerPhase::Running, true),
                worker("g-worker-1", WorkerPhase::Running, false),
            ],
        });
        assert_eq!(status.count_ready, 1);
        assert!(!status.is_ready(2));
        assert_eq!(status.unready_workers("g", 2), vec!["g-worker-1".to_string()]);
    }

    #[test]
    fn test_missing_replicas_are_named() {
        let status = PoolStatus::from_group(GroupStatus {
            ready_count: 1,
            total_count: 1,
            workers: vec![worker("g-worker-0", WorkerPhase::Running, true)],
        });
        assert_eq!(
            status.unready_workers("g", 3),
            vec!["g-worker-1".to_string(), "g-worker-2".to_string()]
        );
    }

    #[test]
    fn test_worker_errors_are_collected() {
        let mut failed = worker("g-worker-0", WorkerPhase::Failed, false);
        failed.error = Some("ImagePullBackOff".into());
        let status = PoolStatus::from_group(GroupStatus {
            ready_count: 0,
            total_count: 1,
            workers: vec![failed],
        });
        assert_eq!(status.errors, vec!["g-worker-0: ImagePullBackOff".to_string()]);
    }

    #[test]
    fn test_surplus_replica_is_not_degraded() {
        let status = PoolStatus::from_group(GroupStatus {
            ready_count: 2,
            total_count: 3,
            workers: vec![
                worker("g-worker-0", WorkerPhase::Running, true),
                worker("g-worker-1", WorkerPhase::Running, true),
                worker("g-worker-2", WorkerPhase::Pending, false),
            ],
        });
        assert!(!status.is_ready(2));
        assert!(!status.is_degraded(2));
        assert!(status.is_degraded(3));
    }
}
