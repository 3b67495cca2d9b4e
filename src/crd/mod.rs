//! Custom Resource Definitions for the pool fleet
//!
//! This module contains all CRD types:
//! - PoolCluster: desired pool topology for a fleet
//! - PoolInstance: observed state of one pool on one node
//! - BlockDevice / BlockDeviceClaim: device inventory and bindings
//! - VolumeReplica: consumers hosted on a pool instance

pub mod block_device;
pub mod pool_cluster;
pub mod pool_instance;
pub mod topology;
pub mod volume_replica;

pub use block_device::*;
pub use pool_cluster::*;
pub use pool_instance::*;
pub use topology::*;
pub use volume_replica::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;

/// API group of every resource in this crate
pub const API_GROUP: &str = "storage.billyronks.io";

/// Label carrying the owning PoolCluster name
pub const CLUSTER_NAME_LABEL: &str = "storage.billyronks.io/pool-cluster";

/// Label carrying the PoolInstance a replica lives on
pub const POOL_INSTANCE_LABEL: &str = "storage.billyronks.io/pool-instance";

/// Node hostname label
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Tag label on block devices
pub const BLOCK_DEVICE_TAG_LABEL: &str = "storage.billyronks.io/block-device-tag";

/// Comma separated whitelist of claimable device tags
pub const ALLOWED_TAGS_ANNOTATION: &str = "storage.billyronks.io/allowed-bd-tags";

/// Set to "true" to pause reconciliation of a PoolCluster
pub const RECONCILE_DISABLED_ANNOTATION: &str = "storage.billyronks.io/reconcile-disabled";

/// Finalizer placed on PoolClusters and their claims
pub const CLUSTER_FINALIZER: &str = "storage.billyronks.io/pool-cluster-protection";

/// Finalizer placed on PoolInstances until the physical pool is destroyed
pub const POOL_PROTECTION_FINALIZER: &str = "storage.billyronks.io/pool-protection";
