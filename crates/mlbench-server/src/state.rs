//! Shared application state.

use std::sync::Arc;

use mlbench_cluster::{ClusterManager, HttpCluster, InMemoryCluster};
use mlbench_core::EngineConfig;
use mlbench_runtime::{Orchestrator, RunRegistry};
use tracing::info;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: EngineConfig,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Open the registry snapshot and connect the configured cluster manager.
    pub fn open(config: EngineConfig) -> mlbench_core::Result<Self> {
        let registry = Arc::new(RunRegistry::open(&config.registry_file())?);
        let cluster = Self::connect_cluster(&config)?;
        Ok(Self::with_parts(config, registry, cluster))
    }

    pub fn with_parts(
        config: EngineConfig,
        registry: Arc<RunRegistry>,
        cluster: Arc<dyn ClusterManager>,
    ) -> Self {
        let orchestrator = Orchestrator::new(config.clone(), registry, cluster);
        Self {
            config,
            orchestrator,
        }
    }

    fn connect_cluster(config: &EngineConfig) -> mlbench_core::Result<Arc<dyn ClusterManager>> {
        match &config.cluster_url {
            Some(url) => {
                info!("Using cluster manager at {}", url);
                Ok(Arc::new(HttpCluster::new(
                    url.clone(),
                    config.cluster_call_timeout(),
                )?))
            }
            None => {
                info!("No cluster manager configured, using the in-process simulator");
                Ok(Arc::new(InMemoryCluster::with_timing(
                    std::time::Duration::from_secs(2),
                    std::time::Duration::from_millis(20),
                )))
            }
        }
    }
}
