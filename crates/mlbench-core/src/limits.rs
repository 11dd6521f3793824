//! Resource limiter: turns per-worker ceilings into a resource declaration
//! and a token-bucket bandwidth rule.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Per-worker resource ceilings requested for a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU cores; fractional values are allowed (0.5 = half a core).
    pub cpu_count: f64,
    pub memory_mb: u64,
    pub bandwidth_mbit: u64,
}

impl ResourceLimits {
    /// All three ceilings must be strictly positive.
    pub fn validate(&self) -> Result<()> {
        if !self.cpu_count.is_finite() || self.cpu_count <= 0.0 {
            return Err(Error::Validation(format!(
                "cpu must be a positive number, got {}",
                self.cpu_count
            )));
        }
        if self.memory_mb == 0 {
            return Err(Error::Validation("memory_mb must be positive".into()));
        }
        if self.bandwidth_mbit == 0 {
            return Err(Error::Validation("bandwidth_mbit must be positive".into()));
        }
        Ok(())
    }
}

/// Quantities in cluster-manager notation (`2000m`, `4096Mi`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantities {
    pub cpu: String,
    pub memory: String,
}

/// Token-bucket rate cap applied to each worker independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthShaping {
    pub rate_mbit: u64,
    pub burst_bytes: u64,
}

/// Minimum bucket depth: ten full-size Ethernet frames.
const MIN_BURST_BYTES: u64 = 10 * 1514;

impl BandwidthShaping {
    /// Bucket sized to hold 10ms of traffic at the configured rate.
    pub fn token_bucket(rate_mbit: u64) -> Self {
        Self {
            rate_mbit,
            burst_bytes: rate_mbit.saturating_mul(1250).max(MIN_BURST_BYTES),
        }
    }

    /// Rate in the suffix notation used by bandwidth annotations (`100M`).
    pub fn rate(&self) -> String {
        format!("{}M", self.rate_mbit)
    }

    /// Ingress and egress shaping annotations for a worker.
    pub fn annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        annotations.insert("kubernetes.io/ingress-bandwidth".to_string(), self.rate());
        annotations.insert("kubernetes.io/egress-bandwidth".to_string(), self.rate());
        annotations
    }
}

/// Declaration attached to every worker's creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    /// Requests always equal limits: workers get no burst capacity.
    pub requests: ResourceQuantities,
    pub limits: ResourceQuantities,
    pub bandwidth: BandwidthShaping,
}

/// Stateless translator from [`ResourceLimits`] to [`ResourceDeclaration`].
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimiter {
    max_bandwidth_mbit: u64,
}

impl ResourceLimiter {
    pub fn new(max_bandwidth_mbit: u64) -> Self {
        Self { max_bandwidth_mbit }
    }

    pub fn max_bandwidth_mbit(&self) -> u64 {
        self.max_bandwidth_mbit
    }

    /// Clamp bandwidth to the system maximum. Over-limit requests are capped, not rejected.
    pub fn clamp(&self, limits: ResourceLimits) -> ResourceLimits {
        if limits.bandwidth_mbit > self.max_bandwidth_mbit {
            warn!(
                "Requested bandwidth {} Mbit/s exceeds maximum {} Mbit/s, clamping",
                limits.bandwidth_mbit, self.max_bandwidth_mbit
            );
            ResourceLimits {
                bandwidth_mbit: self.max_bandwidth_mbit,
                ..limits
            }
        } else {
            limits
        }
    }

    pub fn compute_limits(&self, limits: &ResourceLimits) -> Result<ResourceDeclaration> {
        limits.validate()?;
        let limits = self.clamp(*limits);

        let cpu_millis = ((limits.cpu_count * 1000.0).ceil() as u64).max(1);
        let quantities = ResourceQuantities {
            cpu: format!("{cpu_millis}m"),
            memory: format!("{}Mi", limits.memory_mb),
        };

        Ok(ResourceDeclaration {
            requests: quantities.clone(),
            limits: quantities,
            bandwidth: BandwidthShaping::token_bucket(limits.bandwidth_mbit),
        })
    }
}
