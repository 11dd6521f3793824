//! Runtime request and record types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mlbench_cluster::WorkerStatus;
use mlbench_core::{ResourceLimits, RunId, RunState};
use serde::{Deserialize, Deserializer, Serialize};

/// Parameters of a create-run request.
///
/// Field aliases accept the names used by the run form (`num_workers`,
/// `num_cpus`, `max_bandwidth`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub id: Option<RunId>,
    pub name: String,
    #[serde(alias = "num_workers")]
    pub worker_count: u32,
    #[serde(alias = "num_cpus")]
    pub cpu: f64,
    #[serde(alias = "memory")]
    pub memory_mb: u64,
    #[serde(alias = "max_bandwidth")]
    pub bandwidth_mbit: u64,
}

impl CreateRunRequest {
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_count: self.cpu,
            memory_mb: self.memory_mb,
            bandwidth_mbit: self.bandwidth_mbit,
        }
    }
}

/// One metric sample posted by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub date: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub cumulative: bool,
    /// Worker that produced the sample; absent for run-level metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

/// Body of a metric post.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMetric {
    pub run_id: RunId,
    pub name: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    /// Workers post values as strings (`"0.912000"`); plain numbers are accepted too.
    #[serde(deserialize_with = "number_or_string")]
    pub value: f64,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub cumulative: bool,
    #[serde(default, alias = "pod_name")]
    pub worker: Option<String>,
}

/// Every stored metric, grouped by run id and by reporting worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsOverview {
    pub run_metrics: BTreeMap<String, BTreeMap<String, Vec<Metric>>>,
    pub worker_metrics: BTreeMap<String, BTreeMap<String, Vec<Metric>>>,
}

/// One worker in the cross-run listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunWorker {
    pub run_id: RunId,
    pub run_name: String,
    pub run_state: RunState,
    #[serde(flatten)]
    pub worker: WorkerStatus,
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_accepts_form_names() {
        let req: CreateRunRequest = serde_json::from_value(serde_json::json!({
            "name": "bench1",
            "num_workers": 4,
            "num_cpus": 0.5,
            "memory_mb": 4096,
            "max_bandwidth": 100,
        }))
        .unwrap();
        assert_eq!(req.worker_count, 4);
        assert_eq!(req.resource_limits().cpu_count, 0.5);
        assert_eq!(req.resource_limits().bandwidth_mbit, 100);
        assert!(req.id.is_none());
    }

    #[test]
    fn test_metric_value_as_string_or_number() {
        let run_id = RunId::new();
        let from_string: NewMetric = serde_json::from_value(serde_json::json!({
            "run_id": run_id,
            "name": "accuracy",
            "value": "0.912000",
        }))
        .unwrap();
        assert_eq!(from_string.value, 0.912);
        assert!(!from_string.cumulative);

        let from_number: NewMetric = serde_json::from_value(serde_json::json!({
            "run_id": run_id,
            "name": "loss",
            "value": 1.5,
            "cumulative": true,
        }))
        .unwrap();
        assert_eq!(from_number.value, 1.5);

        let bad = serde_json::from_value::<NewMetric>(serde_json::json!({
            "run_id": run_id,
            "name": "loss",
            "value": "n/a",
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_metric_accepts_pod_name() {
        let metric: NewMetric = serde_json::from_value(serde_json::json!({
            "run_id": RunId::new(),
            "pod_name": "g-worker-1",
            "name": "loss",
            "value": "0.25",
        }))
        .unwrap();
        assert_eq!(metric.worker.as_deref(), Some("g-worker-1"));
    }
}
