//! Control plane
//!
//! The PoolCluster reconciler, the PoolInstance deletion controller and the
//! runtimes that drive them, plus the admission API.

pub mod api;
pub mod controller;
pub mod instance;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod status;

pub use api::*;
pub use controller::{requeue_delay, run_kube, run_standalone, Context};
pub use instance::{CommandPoolEngine, DetachedPoolEngine, InstanceController, InstanceOutcome};
pub use metrics::Metrics;
pub use queue::{ObjectKey, QueueHandler, WorkQueue};
pub use reconciler::{LifecycleState, PassSummary, ReconcileOutcome, Reconciler, ReconcilerConfig};
pub use status::StatusAggregator;
