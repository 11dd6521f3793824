//! Worker pools for runs, and the cluster-manager collaborators that host them.
//!
//! The [`WorkerPoolManager`] owns every pool handle and talks to a
//! [`ClusterManager`]: either a remote service over HTTP ([`HttpCluster`]) or
//! the in-process simulator ([`InMemoryCluster`]) used for local development
//! and tests.

pub mod cluster;
pub mod http;
pub mod memory;
pub mod pool;
pub mod types;

pub use cluster::ClusterManager;
pub use http::HttpCluster;
pub use memory::InMemoryCluster;
pub use pool::{TeardownOutcome, WorkerPoolManager};
pub use types::*;
