//! Metrics posted by running workers, kept per run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mlbench_core::RunId;

use crate::types::{Metric, MetricsOverview};

#[derive(Default)]
pub struct MetricsStore {
    runs: DashMap<RunId, Vec<Metric>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, run_id: RunId, metric: Metric) {
        self.runs.entry(run_id).or_default().push(metric);
    }

    /// Metrics of a run grouped by name, each group sorted by date.
    /// With `since`, only samples strictly newer than it are returned;
    /// with `worker`, only that worker's samples.
    pub fn query(
        &self,
        run_id: &RunId,
        since: Option<DateTime<Utc>>,
        worker: Option<&str>,
    ) -> BTreeMap<String, Vec<Metric>> {
        match self.runs.get(run_id) {
            Some(metrics) => group_by_name(metrics.iter().filter(|m| {
                !since.is_some_and(|since| m.date <= since)
                    && worker.map_or(true, |w| m.worker.as_deref() == Some(w))
            })),
            None => BTreeMap::new(),
        }
    }

    /// Every stored metric, grouped per run and per reporting worker.
    pub fn overview(&self) -> MetricsOverview {
        let mut overview = MetricsOverview::default();
        let mut by_worker: BTreeMap<String, Vec<&Metric>> = BTreeMap::new();
        let runs: Vec<_> = self
            .runs
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (run_id, metrics) in &runs {
            overview
                .run_metrics
                .insert(run_id.to_string(), group_by_name(metrics.iter()));
            for metric in metrics {
                if let Some(worker) = &metric.worker {
                    by_worker.entry(worker.clone()).or_default().push(metric);
                }
            }
        }
        for (worker, metrics) in by_worker {
            overview
                .worker_metrics
                .insert(worker, group_by_name(metrics.into_iter()));
        }
        overview
    }

    pub fn count(&self, run_id: &RunId) -> usize {
        self.runs.get(run_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn remove(&self, run_id: &RunId) {
        self.runs.remove(run_id);
    }
}

fn group_by_name<'a>(metrics: impl Iterator<Item = &'a Metric>) -> BTreeMap<String, Vec<Metric>> {
    let mut grouped: BTreeMap<String, Vec<Metric>> = BTreeMap::new();
    for metric in metrics {
        grouped
            .entry(metric.name.clone())
            .or_default()
            .push(metric.clone());
    }
    for samples in grouped.values_mut() {
        samples.sort_by(|a, b| a.date.cmp(&b.date));
    }
    grouped
}
