//! Orchestrator: the entry point for every run operation.
//!
//! Requests are validated and applied to the registry synchronously; cluster
//! work (pool creation and teardown) runs on spawned tasks that report back
//! by firing events or updating the run's teardown record.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use mlbench_cluster::{ClusterManager, PoolStatus, TeardownOutcome, WorkerPoolManager};
use mlbench_core::{
    EngineConfig, Error, NewRun, ResourceDeclaration, ResourceLimiter, Result, Run, RunEvent,
    RunId, RunState, RunSummary, WorkerPoolHandle,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsStore;
use crate::registry::RunRegistry;
use crate::types::{CreateRunRequest, Metric, MetricsOverview, NewMetric, RunWorker};

pub struct Orchestrator {
    config: EngineConfig,
    limiter: ResourceLimiter,
    registry: Arc<RunRegistry>,
    pools: WorkerPoolManager,
    metrics: MetricsStore,
    /// Serializes the active-run count check with the insert.
    admission: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        registry: Arc<RunRegistry>,
        cluster: Arc<dyn ClusterManager>,
    ) -> Arc<Self> {
        let limiter = ResourceLimiter::new(config.max_bandwidth_mbit);
        let pools = WorkerPoolManager::new(cluster, config.ssh_port);
        info!(
            "Orchestrator initialized: max_bandwidth={}Mbit, provision_timeout={}s, worker_lost_polls={}",
            config.max_bandwidth_mbit, config.provision_timeout_secs, config.worker_lost_polls
        );
        Arc::new(Self {
            config,
            limiter,
            registry,
            pools,
            metrics: MetricsStore::new(),
            admission: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn pools(&self) -> &WorkerPoolManager {
        &self.pools
    }

    // ---------------------------------------------------------------
    // Run operations
    // ---------------------------------------------------------------

    /// Create a run and start provisioning its pool.
    ///
    /// Returns once the run is `provisioning`; the pool is requested in the
    /// background. Bandwidth above the system maximum is clamped; worker
    /// count, CPU and memory above the form ceilings are rejected.
    pub fn create_run(self: &Arc<Self>, request: CreateRunRequest) -> Result<Run> {
        let spec = NewRun {
            id: request.id,
            resource_limits: self.limiter.clamp(request.resource_limits()),
            name: request.name,
            worker_count: request.worker_count,
        };
        spec.validate()?;
        self.config
            .form_limits()
            .check(spec.worker_count, &spec.resource_limits)?;

        let run = {
            let _admission = self.admission.lock();
            if let Some(max) = self.config.max_active_runs {
                let active = self.registry.count_active();
                if active >= max {
                    return Err(Error::Conflict(format!(
                        "{active} runs are already active (maximum {max})"
                    )));
                }
            }
            self.registry.create(spec)?
        };
        info!(
            "Run {} created: name={}, workers={}, cpu={}, memory={}MB, bandwidth={}Mbit",
            run.id,
            run.name,
            run.desired_worker_count,
            run.resource_limits.cpu_count,
            run.resource_limits.memory_mb,
            run.resource_limits.bandwidth_mbit
        );

        self.start_provisioning(&run.id)
    }

    pub fn get_run(&self, id: &RunId) -> Result<Run> {
        self.registry.get(id)
    }

    pub fn list_runs(&self) -> Vec<RunSummary> {
        self.registry.list().iter().map(Run::summary).collect()
    }

    /// Full records of every run.
    pub fn runs(&self) -> Vec<Run> {
        self.registry.list()
    }

    /// Cancel immediately; the pool is torn down in the background.
    pub fn cancel_run(self: &Arc<Self>, id: &RunId) -> Result<Run> {
        self.fire(id, RunEvent::CancelRequested)
    }

    /// Completion signal from the workload.
    pub fn complete_run(self: &Arc<Self>, id: &RunId) -> Result<Run> {
        self.fire(id, RunEvent::CompletionSignal)
    }

    /// Remove a terminal run whose pool is released, along with its metrics.
    pub fn delete_run(&self, id: &RunId) -> Result<Run> {
        let run = self.registry.delete(id)?;
        self.pools.forget(id);
        self.metrics.remove(id);
        info!("Run {} deleted", id);
        Ok(run)
    }

    /// Live readiness of a run's pool. Runs without a pool report an empty status.
    pub async fn pool_status(&self, id: &RunId) -> Result<PoolStatus> {
        let run = self.registry.get(id)?;
        match &run.worker_pool_ref {
            Some(handle) => self.poll_pool(handle).await,
            None => Ok(PoolStatus::default()),
        }
    }

    /// Every worker of every run that holds a pool. Pools that cannot be
    /// polled are left out of the listing.
    pub async fn list_workers(&self) -> Vec<RunWorker> {
        let runs: Vec<Run> = self
            .registry
            .list()
            .into_iter()
            .filter(|r| r.worker_pool_ref.is_some())
            .collect();
        let polls = join_all(runs.iter().filter_map(|run| {
            run.worker_pool_ref
                .as_ref()
                .map(|handle| self.poll_pool(handle))
        }))
        .await;

        let mut workers = Vec::new();
        for (run, poll) in runs.iter().zip(polls) {
            match poll {
                Ok(status) => workers.extend(status.workers.into_iter().map(|worker| RunWorker {
                    run_id: run.id,
                    run_name: run.name.clone(),
                    run_state: run.state,
                    worker,
                })),
                Err(e) => warn!("Run {}: workers could not be listed: {}", run.id, e),
            }
        }
        workers
    }

    /// Pick up runs restored from the snapshot: `pending` runs are
    /// provisioned and `provisioning` runs have their pool requested again.
    /// Teardowns still owed by terminal runs are left to the reconciliation loop.
    pub fn resume(self: &Arc<Self>) -> usize {
        let mut resumed = 0;
        for run in self.registry.list() {
            let result = match run.state {
                RunState::Pending => self.start_provisioning(&run.id).map(|_| ()),
                RunState::Provisioning => self.request_pool(&run, false),
                _ => continue,
            };
            match result {
                Ok(()) => resumed += 1,
                Err(e) => warn!("Could not resume run {}: {}", run.id, e),
            }
        }
        if resumed > 0 {
            info!("Resumed provisioning of {} runs", resumed);
        }
        resumed
    }

    // ---------------------------------------------------------------
    // Metrics
    // ---------------------------------------------------------------

    pub fn record_metric(&self, metric: NewMetric) -> Result<Metric> {
        self.registry.get(&metric.run_id)?;
        let stored = Metric {
            name: metric.name,
            date: metric.date.unwrap_or_else(Utc::now),
            value: metric.value,
            metadata: metric.metadata,
            cumulative: metric.cumulative,
            worker: metric.worker,
        };
        debug!("Metric {}={} recorded for run {}", stored.name, stored.value, metric.run_id);
        self.metrics.record(metric.run_id, stored.clone());
        Ok(stored)
    }

    /// A run's metrics, optionally restricted to samples newer than `since`
    /// and to one worker.
    pub fn metrics(
        &self,
        run_id: &RunId,
        since: Option<DateTime<Utc>>,
        worker: Option<&str>,
    ) -> Result<BTreeMap<String, Vec<Metric>>> {
        self.registry.get(run_id)?;
        Ok(self.metrics.query(run_id, since, worker))
    }

    pub fn metrics_overview(&self) -> MetricsOverview {
        self.metrics.overview()
    }

    // ---------------------------------------------------------------
    // Transitions and cluster work
    // ---------------------------------------------------------------

    /// Apply `event` to a run and start any teardown it schedules.
    pub fn fire(self: &Arc<Self>, id: &RunId, event: RunEvent) -> Result<Run> {
        let now = Utc::now();
        let event_name = event.name();
        let (run, transition) = self.registry.update(id, |run| {
            let transition = run.apply(event, now)?;
            Ok((run.clone(), transition))
        })?;

        match &run.last_error {
            Some(reason) if transition.to == RunState::Failed => info!(
                "Run {}: {} -> {} on {} ({})",
                id, transition.from, transition.to, event_name, reason
            ),
            _ => info!(
                "Run {}: {} -> {} on {}",
                id, transition.from, transition.to, event_name
            ),
        }

        if transition.teardown.is_some() {
            self.spawn_teardown(id);
        }
        Ok(run)
    }

    /// Claim the run's pending teardown and issue it on a background task.
    /// Returns false if nothing is owed or an attempt is already in flight.
    pub fn spawn_teardown(self: &Arc<Self>, id: &RunId) -> bool {
        let handle = match self.registry.update(id, |run| Ok(run.begin_teardown_attempt())) {
            Ok(Some(handle)) => handle,
            _ => return false,
        };
        let this = Arc::clone(self);
        let id = *id;
        tokio::spawn(async move { this.run_teardown(id, handle).await });
        true
    }

    /// Poll a pool, bounded by the per-call timeout.
    pub async fn poll_pool(&self, handle: &WorkerPoolHandle) -> Result<PoolStatus> {
        self.bounded(self.pools.poll_readiness(handle)).await
    }

    /// Ask for the pool of a `provisioning` run on a background task. With
    /// `recreate`, the create call is re-issued even if the pool was created
    /// before (its worker group went missing).
    pub fn request_pool(self: &Arc<Self>, run: &Run, recreate: bool) -> Result<()> {
        let declaration = self.limiter.compute_limits(&run.resource_limits)?;
        let this = Arc::clone(self);
        let id = run.id;
        let desired = run.desired_worker_count;
        tokio::spawn(async move { this.provision(id, desired, declaration, recreate).await });
        Ok(())
    }

    fn start_provisioning(self: &Arc<Self>, id: &RunId) -> Result<Run> {
        let pending = self.registry.get(id)?;
        self.limiter.compute_limits(&pending.resource_limits)?;
        let run = self.fire(id, RunEvent::ProvisionRequested)?;
        self.request_pool(&run, false)?;
        Ok(run)
    }

    async fn provision(
        self: Arc<Self>,
        id: RunId,
        desired: u32,
        declaration: ResourceDeclaration,
        recreate: bool,
    ) {
        let secret = &self.config.ssh_secret;
        let result = if recreate {
            self.pools.recreate_pool(id, desired, &declaration, secret).await
        } else {
            self.pools.create_pool(id, desired, &declaration, secret).await
        };

        let error = match result {
            Ok(handle) => {
                debug!("Worker pool {} requested for run {}", handle.group, id);
                return;
            }
            // The run was cancelled and its pool released before creation started.
            Err(Error::Conflict(reason)) => {
                debug!("Provisioning of run {} skipped: {}", id, reason);
                return;
            }
            Err(e) => e,
        };

        warn!("Provisioning run {} failed: {}", id, error);
        match self.fire(
            &id,
            RunEvent::ProvisionError {
                reason: error.to_string(),
            },
        ) {
            Ok(_) | Err(Error::InvalidTransition { .. }) | Err(Error::NotFound(_)) => {}
            Err(e) => error!("Failed to record provisioning error for run {}: {}", id, e),
        }
    }

    async fn run_teardown(self: Arc<Self>, id: RunId, handle: WorkerPoolHandle) {
        let result = self.bounded(self.pools.teardown_pool(&handle)).await;
        let now = Utc::now();

        let update = match result {
            Ok(TeardownOutcome::Released) => {
                info!("Run {}: worker pool {} released", id, handle.group);
                self.registry.update(&id, |run| {
                    run.mark_teardown_released(now);
                    Ok(())
                })
            }
            Ok(TeardownOutcome::Deferred) => {
                debug!(
                    "Run {}: teardown of {} deferred until creation returns",
                    id, handle.group
                );
                self.reschedule_teardown(&id, now)
            }
            Err(e) => {
                warn!("Run {}: teardown of {} failed: {}", id, handle.group, e);
                self.reschedule_teardown(&id, now)
            }
        };

        if let Err(e) = update {
            debug!("Run {} changed before its teardown was recorded: {}", id, e);
        }
    }

    fn reschedule_teardown(&self, id: &RunId, now: DateTime<Utc>) -> Result<()> {
        self.registry.update(id, |run| {
            let delay = self.config.teardown_backoff(run.teardown_attempts());
            run.reschedule_teardown(now, delay);
            Ok(())
        })
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.config.cluster_call_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::ClusterManager(format!(
                "no response within {}s",
                timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlbench_cluster::InMemoryCluster;
    use mlbench_core::Teardown;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            teardown_backoff_secs: 1,
            ..EngineConfig::default()
        }
    }

    fn request(name: &str, bandwidth_mbit: u64) -> CreateRunRequest {
        CreateRunRequest {
            id: None,
            name: name.into(),
            worker_count: 2,
            cpu: 1.0,
            memory_mb: 1024,
            bandwidth_mbit,
        }
    }

    fn orchestrator(cluster: &InMemoryCluster, config: EngineConfig) -> Arc<Orchestrator> {
        Orchestrator::new(
            config,
            Arc::new(RunRegistry::in_memory()),
            Arc::new(cluster.clone()),
        )
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_create_run_starts_provisioning() {
        let cluster = InMemoryCluster::new();
        let orch = orchestrator(&cluster, config());

        let run = orch.create_run(request("bench1", 100)).unwrap();
        assert_eq!(run.state, RunState::Provisioning);
        assert!(run.worker_pool_ref.is_some());

        let group = run.worker_pool_ref.unwrap().group;
        wait_for(|| cluster.has_group(&group)).await;
        assert_eq!(cluster.worker_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_request_creates_nothing() {
        let cluster = InMemoryCluster::new();
        let orch = orchestrator(&cluster, config());

        let mut bad = request("bench1", 100);
        bad.cpu = 0.0;
        assert!(matches!(orch.create_run(bad), Err(Error::Validation(_))));
        assert!(orch.list_runs().is_empty());
    }

    #[tokio::test]
    async fn test_bandwidth_is_clamped() {
        let cluster = InMemoryCluster::new();
        let orch = orchestrator(&cluster, config());

        let run = orch.create_run(request("bench1", 50_000)).unwrap();
        assert_eq!(run.resource_limits.bandwidth_mbit, 10_000);
    }

    #[tokio::test]
    async fn test_requests_above_form_ceilings_are_rejected() {
        let cluster = InMemoryCluster::new();
        let orch = orchestrator(
            &cluster,
            EngineConfig {
                max_workers: 64,
                ..config()
            },
        );

        let mut huge = request("bench1", 100);
        huge.worker_count = 100_000;
        assert!(matches!(orch.create_run(huge), Err(Error::Validation(_))));

        let mut cpu = request("bench1", 100);
        cpu.cpu = 1e6;
        assert!(matches!(orch.create_run(cpu), Err(Error::Validation(_))));

        let mut memory = request("bench1", 100);
        memory.memory_mb = u64::MAX;
        assert!(matches!(orch.create_run(memory), Err(Error::Validation(_))));

        assert!(orch.list_runs().is_empty());
        tokio::task::yield_now().await;
        assert_eq!(cluster.group_count(), 0);

        let mut at_ceiling = request("bench1", 100);
        at_ceiling.worker_count = 64;
        orch.create_run(at_ceiling).unwrap();
    }

    #[tokio::test]
    async fn test_list_workers_across_runs() {
        let cluster = InMemoryCluster::new();
        let orch = orchestrator(&cluster, config());
        let a = orch.create_run(request("a", 100)).unwrap();
        let b = orch.create_run(request("b", 100)).unwrap();
        wait_for(|| cluster.worker_count() == 4).await;

        let workers = orch.list_workers().await;
        assert_eq!(workers.len(), 4);
        assert_eq!(workers.iter().filter(|w| w.run_id == a.id).count(), 2);
        assert_eq!(workers.iter().filter(|w| w.run_id == b.id).count(), 2);
        assert!(workers.iter().all(|w| w.worker.is_ready()));

        orch.cancel_run(&a.id).unwrap();
        let workers = orch.list_workers().await;
        assert!(workers.iter().all(|w| w.run_id == b.id));
    }

    #[tokio::test]
    async fn test_admission_cap() {
        let cluster = InMemoryCluster::new();
        let orch = orchestrator(
            &cluster,
            EngineConfig {
                max_active_runs: Some(1),
                ..config()
            },
        );

        let first = orch.create_run(request("a", 100)).unwrap();
        assert!(matches!(
            orch.create_run(request("b", 100)),
            Err(Error::Conflict(_))
        ));

        orch.cancel_run(&first.id).unwrap();
        orch.create_run(request("b", 100)).unwrap();
    }

    #[tokio::test]
    async fn test_cancel_terminal_run_is_rejected() {
        let cluster = InMemoryCluster::new();
        let orch = orchestrator(&cluster, config());
        let run = orch.create_run(request("bench1", 100)).unwrap();

        orch.cancel_run(&run.id).unwrap();
        let err = orch.cancel_run(&run.id).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: RunState::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_fails_run() {
        let cluster = InMemoryCluster::new();
        cluster.set_unavailable(true);
        let orch = orchestrator(&cluster, config());

        let run = orch.create_run(request("bench1", 100)).unwrap();
        wait_for(|| orch.get_run(&run.id).unwrap().state == RunState::Failed).await;

        let failed = orch.get_run(&run.id).unwrap();
        assert!(failed
            .last_error
            .unwrap()
            .contains("Provisioning unavailable"));
        assert_eq!(cluster.group_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_pool() {
        let cluster = InMemoryCluster::new();
        let orch = orchestrator(&cluster, config());
        let run = orch.create_run(request("bench1", 100)).unwrap();
        let group = run.worker_pool_ref.clone().unwrap().group;
        wait_for(|| cluster.has_group(&group)).await;

        let cancelled = orch.cancel_run(&run.id).unwrap();
        assert_eq!(cancelled.state, RunState::Cancelled);
        assert!(cancelled.worker_pool_ref.is_none());

        wait_for(|| orch.get_run(&run.id).unwrap().resources_released()).await;
        assert!(!cluster.has_group(&group));
        assert!(matches!(
            orch.get_run(&run.id).unwrap().teardown,
            Teardown::Released { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_teardown_is_rescheduled() {
        let cluster = InMemoryCluster::new();
        let orch = orchestrator(&cluster, config());
        let run = orch.create_run(request("bench1", 100)).unwrap();
        let group = run.worker_pool_ref.clone().unwrap().group;
        wait_for(|| cluster.has_group(&group)).await;

        cluster.fail_next_deletes(1);
        orch.cancel_run(&run.id).unwrap();
        wait_for(|| orch.get_run(&run.id).unwrap().teardown_attempts() == 1).await;

        let run = orch.get_run(&run.id).unwrap();
        assert!(!run.resources_released());
        assert!(cluster.has_group(&group));
        assert!(run.teardown_due(Utc::now()).is_none());
    }

    #[tokio::test]
    async fn test_delete_run_drops_metrics() {
        let cluster = InMemoryCluster::new();
        let orch = orchestrator(&cluster, config());
        let run = orch.create_run(request("bench1", 100)).unwrap();

        orch.record_metric(NewMetric {
            run_id: run.id,
            name: "loss".into(),
            date: None,
            value: 0.5,
            metadata: String::new(),
            cumulative: false,
            worker: Some("worker-0".into()),
        })
        .unwrap();
        assert_eq!(orch.metrics(&run.id, None, None).unwrap()["loss"].len(), 1);
        assert_eq!(
            orch.metrics(&run.id, None, Some("worker-0")).unwrap()["loss"].len(),
            1
        );
        assert!(orch.metrics(&run.id, None, Some("worker-1")).unwrap().is_empty());
        assert_eq!(orch.metrics_overview().worker_metrics["worker-0"]["loss"].len(), 1);

        assert!(matches!(orch.delete_run(&run.id), Err(Error::Conflict(_))));
        orch.cancel_run(&run.id).unwrap();
        wait_for(|| orch.get_run(&run.id).unwrap().resources_released()).await;

        orch.delete_run(&run.id).unwrap();
        assert!(matches!(
            orch.metrics(&run.id, None, None),
            Err(Error::NotFound(_))
        ));
        assert!(orch.metrics_overview().run_metrics.is_empty());
    }

    #[tokio::test]
    async fn test_metric_for_unknown_run() {
        let cluster = InMemoryCluster::new();
        let orch = orchestrator(&cluster, config());
        let err = orch
            .record_metric(NewMetric {
                run_id: RunId::new(),
                name: "loss".into(),
                date: None,
                value: 0.5,
                metadata: String::new(),
                cumulative: false,
                worker: None,
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
