//! Error types for mlbench.

use thiserror::Error;

use crate::run::RunState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Provisioning unavailable: {0}")]
    ProvisioningUnavailable(String),

    #[error("Invalid transition: cannot apply {event} to a run in state {from}")]
    InvalidTransition { from: RunState, event: &'static str },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Partial readiness timeout: {0}")]
    PartialReadinessTimeout(String),

    #[error("Duplicate run: {0}")]
    DuplicateRun(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cluster manager error: {0}")]
    ClusterManager(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
