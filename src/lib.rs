//! Pool Fleet Operator
//!
//! Keeps a fleet of per-node storage pools in line with a declared
//! topology, and guards edits of that topology before they are stored.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          Control Plane                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌───────────────────┐  │
//! │  │ PoolCluster      │  │ PoolInstance     │  │ Validation        │  │
//! │  │ Reconciler       │  │ Controller       │  │ Webhook           │  │
//! │  └────────┬─────────┘  └────────┬─────────┘  └─────────┬─────────┘  │
//! │           └─────────────────────┼──────────────────────┘            │
//! │                      ┌──────────┴──────────┐                        │
//! │                      │   Topology Engine   │                        │
//! │                      │ resolve/claim/diff  │                        │
//! │                      └──────────┬──────────┘                        │
//! ├─────────────────────────────────┼───────────────────────────────────┤
//! │                        Store Ports                                   │
//! │  ┌─────────────────────────────┐  ┌───────────────────────────────┐ │
//! │  │   Kubernetes (kube::Api)    │  │   Memory (standalone, tests)  │ │
//! │  └─────────────────────────────┘  └───────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: reconcilers, runtimes, metrics and the webhook API
//! - [`topology`]: node resolution, device claims, instance builder, diffing
//! - [`validation`]: the admission gate
//! - [`store`]: Kubernetes and in-memory adapters
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: port traits
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod retry;
pub mod store;
pub mod topology;
pub mod validation;

// Re-export commonly used types
pub use controlplane::{
    Context, InstanceController, Metrics, ReconcileOutcome, Reconciler, ReconcilerConfig,
    WebhookServerConfig,
};

pub use crd::{
    BlockDevice, BlockDeviceClaim, ClusterPhase, PoolCluster, PoolClusterSpec,
    PoolClusterStatus, PoolConfig, PoolInstance, PoolSpec, RaidGroup, RaidType, VolumeReplica,
};

pub use domain::ports::{EventRecorder, ObjectEvent, PoolEngine, Stores};

pub use error::{Error, ErrorAction, Result};

pub use retry::RetryPolicy;

pub use store::{FleetSnapshot, KubeStore, MemoryStore};

pub use validation::{AdmissionVerdict, ValidationGate};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
