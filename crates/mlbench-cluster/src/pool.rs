//! Worker pool manager: creates, observes and tears down the worker pool of each run.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mlbench_core::{Error, ResourceDeclaration, Result, RunId, WorkerPoolHandle};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cluster::ClusterManager;
use crate::types::{PoolStatus, WorkerGroupSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolPhase {
    /// The create call is in flight.
    Creating { teardown_requested: bool },
    Active,
    TornDown,
}

struct PoolEntry {
    handle: WorkerPoolHandle,
    phase: PoolPhase,
}

/// Result of a teardown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TeardownOutcome {
    /// The cluster manager confirmed the pool is gone.
    Released,
    /// Creation is still in flight; the pool is deleted as soon as it returns.
    Deferred,
}

pub struct WorkerPoolManager {
    cluster: Arc<dyn ClusterManager>,
    ssh_port: u16,
    pools: DashMap<RunId, PoolEntry>,
}

impl WorkerPoolManager {
    pub fn new(cluster: Arc<dyn ClusterManager>, ssh_port: u16) -> Self {
        Self {
            cluster,
            ssh_port,
            pools: DashMap::new(),
        }
    }

    /// Ask the cluster manager to start `desired_count` workers for `run_id`.
    ///
    /// Calling again while the pool exists returns the existing handle. A pool
    /// that was torn down is never recreated for the same run. If the create
    /// call fails the entry is kept as active, so a later teardown still asks
    /// the cluster manager to remove anything it may have started.
    pub async fn create_pool(
        &self,
        run_id: RunId,
        desired_count: u32,
        declaration: &ResourceDeclaration,
        secret_ref: &str,
    ) -> Result<WorkerPoolHandle> {
        self.request_group(run_id, desired_count, declaration, secret_ref, false)
            .await
    }

    /// Re-issue the create call for a pool whose worker group the cluster
    /// manager no longer reports. A create already in flight is not repeated.
    pub async fn recreate_pool(
        &self,
        run_id: RunId,
        desired_count: u32,
        declaration: &ResourceDeclaration,
        secret_ref: &str,
    ) -> Result<WorkerPoolHandle> {
        self.request_group(run_id, desired_count, declaration, secret_ref, true)
            .await
    }

    async fn request_group(
        &self,
        run_id: RunId,
        desired_count: u32,
        declaration: &ResourceDeclaration,
        secret_ref: &str,
        recreate: bool,
    ) -> Result<WorkerPoolHandle> {
        let handle = WorkerPoolHandle::for_run(run_id);

        match self.pools.entry(run_id) {
            Entry::Occupied(mut entry) => {
                let phase = entry.get().phase;
                match phase {
                    PoolPhase::TornDown => {
                        return Err(Error::Conflict(format!(
                            "worker pool {} has already been torn down",
                            handle.group
                        )));
                    }
                    PoolPhase::Active if recreate => {
                        entry.get_mut().phase = PoolPhase::Creating {
                            teardown_requested: false,
                        };
                    }
                    _ => {
                        debug!("Worker pool {} already exists", handle.group);
                        return Ok(entry.get().handle.clone());
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(PoolEntry {
                    handle: handle.clone(),
                    phase: PoolPhase::Creating {
                        teardown_requested: false,
                    },
                });
            }
        }

        let spec = self.group_spec(&handle, desired_count, declaration, secret_ref);
        info!(
            "Creating worker pool {}: {} workers, cpu={}, memory={}, bandwidth={}",
            handle.group,
            desired_count,
            declaration.limits.cpu,
            declaration.limits.memory,
            declaration.bandwidth.rate()
        );

        let result = self.cluster.create_worker_group(&spec).await;

        let teardown_requested = match self.pools.get_mut(&run_id) {
            Some(mut entry) => {
                let requested = matches!(
                    entry.phase,
                    PoolPhase::Creating {
                        teardown_requested: true
                    }
                );
                entry.phase = PoolPhase::Active;
                requested
            }
            None => false,
        };

        if teardown_requested {
            info!(
                "Worker pool {} was released while being created, deleting",
                handle.group
            );
            if let Err(e) = self.teardown_pool(&handle).await {
                warn!("Deferred teardown of {} failed: {}", handle.group, e);
            }
        }

        result.map(|()| handle)
    }

    /// Non-blocking readiness snapshot.
    pub async fn poll_readiness(&self, handle: &WorkerPoolHandle) -> Result<PoolStatus> {
        if let Some(entry) = self.pools.get(&handle.run_id) {
            if entry.phase != PoolPhase::Active {
                return Ok(PoolStatus::default());
            }
        }

        match self.cluster.worker_group_status(&handle.group).await {
            Ok(status) => Ok(PoolStatus::from_group(status)),
            Err(Error::NotFound(_)) => Ok(PoolStatus {
                errors: vec![format!("worker group {} not found", handle.group)],
                group_missing: true,
                ..PoolStatus::default()
            }),
            Err(e) => Err(e),
        }
    }

    /// Delete the pool's workers and identity. Safe to repeat.
    pub async fn teardown_pool(&self, handle: &WorkerPoolHandle) -> Result<TeardownOutcome> {
        {
            let mut entry = self
                .pools
                .entry(handle.run_id)
                .or_insert_with(|| PoolEntry {
                    handle: handle.clone(),
                    phase: PoolPhase::Active,
                });
            match &mut entry.phase {
                PoolPhase::TornDown => return Ok(TeardownOutcome::Released),
                PoolPhase::Creating { teardown_requested } => {
                    *teardown_requested = true;
                    return Ok(TeardownOutcome::Deferred);
                }
                PoolPhase::Active => {}
            }
        }

        self.cluster.delete_worker_group(&handle.group).await?;

        if let Some(mut entry) = self.pools.get_mut(&handle.run_id) {
            entry.phase = PoolPhase::TornDown;
        }
        info!("Worker pool {} torn down", handle.group);
        Ok(TeardownOutcome::Released)
    }

    /// Drop all knowledge of a run's pool. Only for runs removed from the registry.
    pub fn forget(&self, run_id: &RunId) {
        self.pools.remove(run_id);
    }

    /// Pools that have been requested and not torn down.
    pub fn live_pools(&self) -> usize {
        self.pools
            .iter()
            .filter(|e| e.phase != PoolPhase::TornDown)
            .count()
    }

    fn group_spec(
        &self,
        handle: &WorkerPoolHandle,
        count: u32,
        declaration: &ResourceDeclaration,
        secret_ref: &str,
    ) -> WorkerGroupSpec {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "mlbench".to_string());
        labels.insert("component".to_string(), "worker".to_string());
        labels.insert("mlbench/run-id".to_string(), handle.run_id.to_string());

        WorkerGroupSpec {
            name: handle.group.clone(),
            run_id: handle.run_id,
            count,
            declaration: declaration.clone(),
            secret_ref: secret_ref.to_string(),
            ssh_port: self.ssh_port,
            labels,
            annotations: declaration.bandwidth.annotations(),
        }
    }
}
