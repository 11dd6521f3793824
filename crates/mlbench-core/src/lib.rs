//! mlbench core: run model, lifecycle state machine, resource limits, configuration.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod limits;
pub mod run;

pub use config::{EngineConfig, FormLimits};
pub use error::{Error, Result};
pub use lifecycle::{RunEvent, Transition};
pub use limits::{BandwidthShaping, ResourceDeclaration, ResourceLimiter, ResourceLimits};
pub use run::{NewRun, Run, RunId, RunState, RunSummary, Teardown, WorkerPoolHandle};
