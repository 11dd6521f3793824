use async_trait::async_trait;
use mlbench_core::Result;

use crate::types::{GroupStatus, WorkerGroupSpec};

/// The external system that places and runs worker processes.
///
/// Implementations report an unreachable manager as
/// [`mlbench_core::Error::ProvisioningUnavailable`] and an unknown group as
/// [`mlbench_core::Error::NotFound`].
#[async_trait]
pub trait ClusterManager: Send + Sync {
    /// Materialize `spec.count` workers. Creating an existing group is not an error.
    async fn create_worker_group(&self, spec: &WorkerGroupSpec) -> Result<()>;

    async fn worker_group_status(&self, group: &str) -> Result<GroupStatus>;

    /// Delete all workers and the group's network identity. Deleting a missing group succeeds.
    async fn delete_worker_group(&self, group: &str) -> Result<()>;
}
