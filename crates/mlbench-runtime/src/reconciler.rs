//! Reconciliation loop: compares desired run state against observed pool
//! state on a fixed interval and fires the events that close the gap.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use mlbench_cluster::PoolStatus;
use mlbench_core::{Error, Result, Run, RunEvent, RunState, WorkerPoolHandle};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;
use crate::shutdown::ShutdownToken;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub examined: usize,
    pub transitions: usize,
    pub teardowns_started: usize,
    /// Pools whose worker group had gone missing and was requested again.
    pub pools_requested: usize,
    pub poll_failures: usize,
}

enum Outcome {
    Unchanged,
    Transitioned,
    TeardownStarted,
    PoolRequested,
    PollFailed,
}

impl TickReport {
    fn add(&mut self, outcome: Outcome) {
        self.examined += 1;
        match outcome {
            Outcome::Unchanged => {}
            Outcome::Transitioned => self.transitions += 1,
            Outcome::TeardownStarted => self.teardowns_started += 1,
            Outcome::PoolRequested => self.pools_requested += 1,
            Outcome::PollFailed => self.poll_failures += 1,
        }
    }
}

pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
}

impl Reconciler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Run ticks on the configured interval until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: ShutdownToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.orchestrator.config().reconcile_interval();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Reconciliation loop started (every {:?})", period);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let report = self.tick(Utc::now()).await;
                        if report.transitions > 0 || report.teardowns_started > 0 {
                            info!(
                                "Reconcile: {} runs, {} transitions, {} teardowns started",
                                report.examined, report.transitions, report.teardowns_started
                            );
                        } else {
                            debug!("Reconcile: {:?}", report);
                        }
                    }
                }
            }

            info!("Reconciliation loop stopped");
        })
    }

    /// One pass over a snapshot of all runs, reconciled concurrently.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let runs = self.orchestrator.runs();
        let outcomes = join_all(runs.iter().map(|run| self.reconcile(run, now))).await;

        let mut report = TickReport::default();
        for outcome in outcomes {
            report.add(outcome);
        }
        report
    }

    async fn reconcile(&self, run: &Run, now: DateTime<Utc>) -> Outcome {
        match run.state {
            RunState::Provisioning => self.check_provisioning(run, now).await,
            RunState::Running => self.check_running(run).await,
            state if state.is_terminal() => {
                if run.teardown_due(now).is_some() && self.orchestrator.spawn_teardown(&run.id) {
                    Outcome::TeardownStarted
                } else {
                    Outcome::Unchanged
                }
            }
            _ => Outcome::Unchanged,
        }
    }

    async fn check_provisioning(&self, run: &Run, now: DateTime<Utc>) -> Outcome {
        let Some(handle) = &run.worker_pool_ref else {
            return Outcome::Unchanged;
        };
        let desired = run.desired_worker_count;
        let timeout = self.orchestrator.config().provision_timeout();
        let timed_out = run
            .provisioning_started_at
            .is_some_and(|started| now - started > timeout);

        match self.orchestrator.poll_pool(handle).await {
            Ok(status) if status.is_ready(desired) => self.fire(run, RunEvent::PoolReady),
            Ok(status) if timed_out => {
                let reason = self.timeout_reason(handle, desired, &status);
                self.fire(run, RunEvent::ProvisionTimeout { reason })
            }
            Ok(status) if status.group_missing => {
                info!(
                    "Run {}: worker group {} is missing, requesting it again",
                    run.id, handle.group
                );
                match self.orchestrator.request_pool(run, true) {
                    Ok(()) => Outcome::PoolRequested,
                    Err(e) => {
                        warn!("Run {}: pool could not be requested: {}", run.id, e);
                        Outcome::Unchanged
                    }
                }
            }
            Ok(status) => {
                debug!(
                    "Run {}: {}/{} workers ready",
                    run.id, status.count_ready, desired
                );
                Outcome::Unchanged
            }
            Err(e) if timed_out => {
                let reason = format!(
                    "readiness could not be observed within {}s: {}",
                    timeout.num_seconds(),
                    e
                );
                self.fire(run, RunEvent::ProvisionTimeout { reason })
            }
            Err(e) => {
                warn!("Run {}: readiness poll failed: {}", run.id, e);
                Outcome::PollFailed
            }
        }
    }

    async fn check_running(&self, run: &Run) -> Outcome {
        let Some(handle) = &run.worker_pool_ref else {
            return Outcome::Unchanged;
        };
        let desired = run.desired_worker_count;

        let status = match self.orchestrator.poll_pool(handle).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Run {}: health poll failed: {}", run.id, e);
                return Outcome::PollFailed;
            }
        };

        if !status.is_degraded(desired) {
            if run.degraded_polls > 0 {
                info!("Run {}: all {} workers ready again", run.id, desired);
                if let Err(e) = self.record_degraded_poll(run, false) {
                    debug!("Run {}: degraded-poll reset dropped: {}", run.id, e);
                }
            }
            return Outcome::Unchanged;
        }

        let polls = match self.record_degraded_poll(run, true) {
            Ok(Some(polls)) => polls,
            _ => return Outcome::Unchanged,
        };
        let threshold = self.orchestrator.config().worker_lost_polls;
        if polls < threshold {
            warn!(
                "Run {}: {}/{} workers ready (degraded poll {}/{})",
                run.id, status.count_ready, desired, polls, threshold
            );
            return Outcome::Unchanged;
        }

        let reason = format!(
            "{}/{} workers ready for {} consecutive polls; not ready: {}",
            status.count_ready,
            desired,
            polls,
            status.unready_workers(&handle.group, desired).join(", ")
        );
        self.fire(run, RunEvent::WorkerLost { reason })
    }

    /// Bump or reset the degraded-poll counter. `None` if the run left `running`.
    fn record_degraded_poll(&self, run: &Run, degraded: bool) -> Result<Option<u32>> {
        self.orchestrator.registry().update(&run.id, |r| {
            if r.state != RunState::Running {
                return Ok(None);
            }
            r.degraded_polls = if degraded { r.degraded_polls + 1 } else { 0 };
            Ok(Some(r.degraded_polls))
        })
    }

    fn timeout_reason(&self, handle: &WorkerPoolHandle, desired: u32, status: &PoolStatus) -> String {
        let secs = self.orchestrator.config().provision_timeout_secs;
        if status.count_ready == 0 {
            let mut reason = format!("no workers became ready within {secs}s");
            if !status.errors.is_empty() {
                reason.push_str(&format!(" ({})", status.errors.join("; ")));
            }
            return reason;
        }
        Error::PartialReadinessTimeout(format!(
            "{}/{} workers ready after {}s; not ready: {}",
            status.count_ready,
            desired,
            secs,
            status.unready_workers(&handle.group, desired).join(", ")
        ))
        .to_string()
    }

    fn fire(&self, run: &Run, event: RunEvent) -> Outcome {
        match self.orchestrator.fire(&run.id, event) {
            Ok(_) => Outcome::Transitioned,
            // The run moved on (cancelled, deleted) since the snapshot was taken.
            Err(e @ (Error::InvalidTransition { .. } | Error::NotFound(_))) => {
                debug!("Run {}: event dropped: {}", run.id, e);
                Outcome::Unchanged
            }
            Err(e) => {
                warn!("Run {}: failed to apply event: {}", run.id, e);
                Outcome::Unchanged
            }
        }
    }
}
