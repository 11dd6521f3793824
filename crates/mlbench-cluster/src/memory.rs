//! In-process cluster simulator.
//!
//! Workers start concurrently, each on its own task, after a configurable
//! start-up delay. Faults can be injected to exercise the engine's failure
//! paths: an unreachable API, workers that never become ready, failing
//! deletes, and killed workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mlbench_core::{Error, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cluster::ClusterManager;
use crate::types::{GroupStatus, WorkerGroupSpec, WorkerPhase, WorkerStatus};

struct SimGroup {
    /// Distinguishes a re-created group from the one a start-up task was spawned for.
    generation: u64,
    spec: WorkerGroupSpec,
    workers: Vec<WorkerStatus>,
}

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    stuck_workers: AtomicUsize,
    failing_deletes: AtomicUsize,
}

struct Inner {
    groups: Mutex<HashMap<String, SimGroup>>,
    faults: Faults,
    startup_delay: Duration,
    api_latency: Duration,
    next_address: AtomicU32,
    generation: AtomicU32,
    delete_calls: AtomicUsize,
}

/// Simulated cluster manager. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryCluster {
    inner: Arc<Inner>,
}

impl InMemoryCluster {
    /// Workers become ready as soon as the group is created.
    pub fn new() -> Self {
        Self::with_timing(Duration::ZERO, Duration::ZERO)
    }

    /// `startup_delay` is per worker; `api_latency` applies to every API call.
    pub fn with_timing(startup_delay: Duration, api_latency: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                groups: Mutex::new(HashMap::new()),
                faults: Faults::default(),
                startup_delay,
                api_latency,
                next_address: AtomicU32::new(1),
                generation: AtomicU32::new(0),
                delete_calls: AtomicUsize::new(0),
            }),
        }
    }

    // ---------------------------------------------------------------
    // Fault injection
    // ---------------------------------------------------------------

    /// Make every API call fail as if the manager were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The last `n` workers of every newly created group never become ready.
    pub fn set_stuck_workers(&self, n: usize) {
        self.inner.faults.stuck_workers.store(n, Ordering::SeqCst);
    }

    /// The next `n` delete calls fail.
    pub fn fail_next_deletes(&self, n: usize) {
        self.inner.faults.failing_deletes.store(n, Ordering::SeqCst);
    }

    /// Mark one worker as crashed. Returns false if it does not exist.
    pub fn kill_worker(&self, group: &str, index: usize) -> bool {
        let mut groups = self.inner.groups.lock();
        match groups.get_mut(group).and_then(|g| g.workers.get_mut(index)) {
            Some(worker) => {
                worker.phase = WorkerPhase::Failed;
                worker.ssh_reachable = false;
                worker.error = Some("container exited with code 137".into());
                true
            }
            None => false,
        }
    }

    /// Remove a group behind the engine's back. Returns false if it does not exist.
    pub fn drop_group(&self, group: &str) -> bool {
        self.inner.groups.lock().remove(group).is_some()
    }

    /// Bring a crashed worker back.
    pub fn restart_worker(&self, group: &str, index: usize) -> bool {
        let mut groups = self.inner.groups.lock();
        match groups.get_mut(group).and_then(|g| g.workers.get_mut(index)) {
            Some(worker) => {
                worker.phase = WorkerPhase::Running;
                worker.ssh_reachable = true;
                worker.error = None;
                true
            }
            None => false,
        }
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    pub fn group_count(&self) -> usize {
        self.inner.groups.lock().len()
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.inner.groups.lock().contains_key(group)
    }

    /// Total workers across all groups.
    pub fn worker_count(&self) -> usize {
        self.inner
            .groups
            .lock()
            .values()
            .map(|g| g.workers.len())
            .sum()
    }

    pub fn group_spec(&self, group: &str) -> Option<WorkerGroupSpec> {
        self.inner.groups.lock().get(group).map(|g| g.spec.clone())
    }

    pub fn delete_calls(&self) -> usize {
        self.inner.delete_calls.load(Ordering::SeqCst)
    }

    async fn api_call(&self) -> Result<()> {
        if !self.inner.api_latency.is_zero() {
            tokio::time::sleep(self.inner.api_latency).await;
        }
        if self.inner.faults.unavailable.load(Ordering::SeqCst) {
            return Err(Error::ProvisioningUnavailable(
                "simulated cluster manager is unreachable".into(),
            ));
        }
        Ok(())
    }

    fn allocate_address(&self, port: u16) -> String {
        let n = self.inner.next_address.fetch_add(1, Ordering::SeqCst);
        format!("10.244.{}.{}:{}", (n >> 8) & 0xff, n & 0xff, port)
    }

    fn start_worker(&self, group: &str, generation: u64, index: usize) {
        let mut groups = self.inner.groups.lock();
        let Some(sim) = groups.get_mut(group) else {
            return;
        };
        if sim.generation != generation {
            return;
        }
        let port = sim.spec.ssh_port;
        if let Some(worker) = sim.workers.get_mut(index) {
            if worker.phase == WorkerPhase::Pending {
                worker.phase = WorkerPhase::Running;
                worker.ssh_reachable = true;
                worker.address = Some(self.allocate_address(port));
            }
        }
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterManager for InMemoryCluster {
    async fn create_worker_group(&self, spec: &WorkerGroupSpec) -> Result<()> {
        self.api_call().await?;

        let generation = u64::from(self.inner.generation.fetch_add(1, Ordering::SeqCst));
        let count = spec.count as usize;
        let stuck = self.inner.faults.stuck_workers.load(Ordering::SeqCst).min(count);
        {
            let mut groups = self.inner.groups.lock();
            if groups.contains_key(&spec.name) {
                debug!("Worker group {} already exists", spec.name);
                return Ok(());
            }
            let workers = (0..spec.count)
                .map(|i| WorkerStatus {
                    name: WorkerGroupSpec::worker_name(&spec.name, i),
                    address: None,
                    phase: WorkerPhase::Pending,
                    ssh_reachable: false,
                    error: None,
                })
                .collect();
            groups.insert(
                spec.name.clone(),
                SimGroup {
                    generation,
                    spec: spec.clone(),
                    workers,
                },
            );
        }

        info!(
            "Simulated worker group {} created with {} workers",
            spec.name, spec.count
        );

        for index in 0..count - stuck {
            if self.inner.startup_delay.is_zero() {
                self.start_worker(&spec.name, generation, index);
            } else {
                let cluster = self.clone();
                let group = spec.name.clone();
                let delay = self.inner.startup_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    cluster.start_worker(&group, generation, index);
                });
            }
        }

        Ok(())
    }

    async fn worker_group_status(&self, group: &str) -> Result<GroupStatus> {
        self.api_call().await?;
        let groups = self.inner.groups.lock();
        let sim = groups
            .get(group)
            .ok_or_else(|| Error::NotFound(format!("worker group {group}")))?;
        Ok(GroupStatus {
            ready_count: sim.workers.iter().filter(|w| w.is_ready()).count() as u32,
            total_count: sim.workers.len() as u32,
            workers: sim.workers.clone(),
        })
    }

    async fn delete_worker_group(&self, group: &str) -> Result<()> {
        self.inner.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.api_call().await?;

        let failing = &self.inner.faults.failing_deletes;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::ClusterManager(format!(
                "simulated failure deleting worker group {group}"
            )));
        }

        if self.inner.groups.lock().remove(group).is_some() {
            info!("Simulated worker group {} deleted", group);
        }
        Ok(())
    }
}
