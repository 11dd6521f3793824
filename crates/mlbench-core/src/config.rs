//! Engine configuration, read from the environment with built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::limits::ResourceLimits;

/// Ceilings shown to the presentation layer when it builds the run form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormLimits {
    pub max_workers: u32,
    pub max_cpus: f64,
    pub max_memory_mb: u64,
    pub max_bandwidth_mbit: u64,
}

impl FormLimits {
    /// Reject a request above the worker, CPU or memory ceiling.
    /// Bandwidth is not checked here: it is clamped by the limiter.
    pub fn check(&self, worker_count: u32, limits: &ResourceLimits) -> Result<()> {
        if worker_count > self.max_workers {
            return Err(Error::Validation(format!(
                "worker_count {} exceeds the maximum of {}",
                worker_count, self.max_workers
            )));
        }
        if limits.cpu_count > self.max_cpus {
            return Err(Error::Validation(format!(
                "cpu {} exceeds the maximum of {}",
                limits.cpu_count, self.max_cpus
            )));
        }
        if limits.memory_mb > self.max_memory_mb {
            return Err(Error::Validation(format!(
                "memory_mb {} exceeds the maximum of {}",
                limits.memory_mb, self.max_memory_mb
            )));
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// HTTP server port.
    pub port: u16,
    /// Directory holding the registry snapshot (`runs.json`).
    pub data_dir: PathBuf,
    /// Base URL of an external cluster manager. `None` selects the in-process simulator.
    pub cluster_url: Option<String>,
    /// System-wide bandwidth ceiling per worker; larger requests are clamped.
    pub max_bandwidth_mbit: u64,
    pub reconcile_interval_secs: u64,
    /// Time a run may spend in `provisioning` before it is failed.
    pub provision_timeout_secs: u64,
    /// Consecutive degraded polls before a running run is declared lost.
    pub worker_lost_polls: u32,
    /// Name of the secret holding the SSH key pair mounted into every worker.
    pub ssh_secret: String,
    /// Internal port every worker exposes for inter-worker SSH.
    pub ssh_port: u16,
    /// Cap on non-terminal runs. `None` means unlimited.
    pub max_active_runs: Option<usize>,
    pub teardown_backoff_secs: u64,
    pub teardown_backoff_max_secs: u64,
    /// Upper bound on a single cluster-manager call made from a reconcile tick.
    pub cluster_call_timeout_secs: u64,
    pub max_workers: u32,
    pub max_cpus: f64,
    pub max_memory_mb: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: PathBuf::from("data"),
            cluster_url: None,
            max_bandwidth_mbit: 10_000,
            reconcile_interval_secs: 5,
            provision_timeout_secs: 300,
            worker_lost_polls: 3,
            ssh_secret: "mlbench-ssh-key".to_string(),
            ssh_port: 22,
            max_active_runs: None,
            teardown_backoff_secs: 2,
            teardown_backoff_max_secs: 60,
            cluster_call_timeout_secs: 10,
            max_workers: 64,
            max_cpus: 64.0,
            max_memory_mb: 262_144,
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// Unparseable numeric values fall back to the default.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let cluster_url = lookup("MLBENCH_CLUSTER_URL")
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty());
        if let Some(url) = &cluster_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::Config(format!(
                    "MLBENCH_CLUSTER_URL must be an http(s) URL, got {url}"
                )));
            }
        }

        let config = Self {
            port: lookup("PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
            data_dir: lookup("MLBENCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            cluster_url,
            max_bandwidth_mbit: parse("MLBENCH_MAX_BANDWIDTH_MBIT")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_bandwidth_mbit),
            reconcile_interval_secs: parse("MLBENCH_RECONCILE_INTERVAL_SECS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.reconcile_interval_secs),
            provision_timeout_secs: parse("MLBENCH_PROVISION_TIMEOUT_SECS")
                .unwrap_or(defaults.provision_timeout_secs),
            worker_lost_polls: parse("MLBENCH_WORKER_LOST_POLLS")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.worker_lost_polls),
            ssh_secret: lookup("MLBENCH_SSH_SECRET").unwrap_or(defaults.ssh_secret),
            ssh_port: lookup("MLBENCH_SSH_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.ssh_port),
            max_active_runs: parse("MLBENCH_MAX_ACTIVE_RUNS")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0),
            teardown_backoff_secs: parse("MLBENCH_TEARDOWN_BACKOFF_SECS")
                .unwrap_or(defaults.teardown_backoff_secs),
            teardown_backoff_max_secs: parse("MLBENCH_TEARDOWN_BACKOFF_MAX_SECS")
                .unwrap_or(defaults.teardown_backoff_max_secs),
            cluster_call_timeout_secs: parse("MLBENCH_CLUSTER_CALL_TIMEOUT_SECS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.cluster_call_timeout_secs),
            max_workers: parse("MLBENCH_MAX_WORKERS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.max_workers),
            max_cpus: lookup("MLBENCH_MAX_CPUS")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(defaults.max_cpus),
            max_memory_mb: parse("MLBENCH_MAX_MEMORY_MB").unwrap_or(defaults.max_memory_mb),
        };

        Ok(config)
    }

    /// Path of the registry snapshot file.
    pub fn registry_file(&self) -> PathBuf {
        self.data_dir.join("runs.json")
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn provision_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.provision_timeout_secs as i64)
    }

    pub fn cluster_call_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_call_timeout_secs)
    }

    /// Delay before teardown attempt `attempt + 1`, doubling up to the configured cap.
    pub fn teardown_backoff(&self, attempt: u32) -> chrono::Duration {
        let base = self.teardown_backoff_secs.max(1);
        let secs = base
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.teardown_backoff_max_secs.max(base));
        chrono::Duration::seconds(secs as i64)
    }

    pub fn form_limits(&self) -> FormLimits {
        FormLimits {
            max_workers: self.max_workers,
            max_cpus: self.max_cpus,
            max_memory_mb: self.max_memory_mb,
            max_bandwidth_mbit: self.max_bandwidth_mbit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> Result<EngineConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_vars(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_map(&[]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_bandwidth_mbit, 10_000);
        assert_eq!(config.worker_lost_polls, 3);
        assert!(config.cluster_url.is_none());
        assert!(config.max_active_runs.is_none());
        assert_eq!(config.registry_file(), PathBuf::from("data/runs.json"));
    }

    #[test]
    fn test_overrides_and_fallbacks() {
        let config = from_map(&[
            ("PORT", "9000"),
            ("MLBENCH_MAX_BANDWIDTH_MBIT", "1000"),
            ("MLBENCH_WORKER_LOST_POLLS", "not-a-number"),
            ("MLBENCH_MAX_ACTIVE_RUNS", "1"),
            ("MLBENCH_CLUSTER_URL", "http://cluster:8000/"),
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_bandwidth_mbit, 1000);
        assert_eq!(config.worker_lost_polls, 3);
        assert_eq!(config.max_active_runs, Some(1));
        assert_eq!(config.cluster_url.as_deref(), Some("http://cluster:8000"));
    }

    #[test]
    fn test_rejects_non_http_cluster_url() {
        let err = from_map(&[("MLBENCH_CLUSTER_URL", "cluster:8000")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_teardown_backoff_is_capped() {
        let config = EngineConfig::default();
        assert_eq!(config.teardown_backoff(0).num_seconds(), 2);
        assert_eq!(config.teardown_backoff(1).num_seconds(), 4);
        assert_eq!(config.teardown_backoff(3).num_seconds(), 16);
        assert_eq!(config.teardown_backoff(10).num_seconds(), 60);
        assert_eq!(config.teardown_backoff(u32::MAX).num_seconds(), 60);
    }

    #[test]
    fn test_form_limits_check() {
        let limits = EngineConfig::default().form_limits();
        let within = ResourceLimits {
            cpu_count: 64.0,
            memory_mb: 262_144,
            bandwidth_mbit: 50_000,
        };
        assert!(limits.check(64, &within).is_ok());

        assert!(matches!(limits.check(65, &within), Err(Error::Validation(_))));
        let cpu = ResourceLimits {
            cpu_count: 64.5,
            ..within
        };
        assert!(matches!(limits.check(1, &cpu), Err(Error::Validation(_))));
        let memory = ResourceLimits {
            memory_mb: u64::MAX,
            ..within
        };
        assert!(matches!(limits.check(1, &memory), Err(Error::Validation(_))));
    }
}
