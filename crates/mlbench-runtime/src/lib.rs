//! Run orchestration runtime.
//!
//! The [`Orchestrator`] owns the [`RunRegistry`] and the worker pool manager
//! and is the only entry point for run operations. The [`Reconciler`] is the
//! background loop that drives runs forward from observed pool state.

pub mod metrics;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod shutdown;
pub mod types;

pub use metrics::MetricsStore;
pub use orchestrator::Orchestrator;
pub use reconciler::{Reconciler, TickReport};
pub use registry::RunRegistry;
pub use shutdown::ShutdownToken;
pub use types::*;
