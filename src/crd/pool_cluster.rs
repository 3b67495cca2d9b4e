//! PoolCluster CRD
//!
//! Desired state of a pool fleet: one PoolSpec per node, each with its RAID
//! layout and the block devices it is built from.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::topology::{Condition, PoolConfig, RaidGroup, ResourceSpec, TolerationSpec};
use super::{ALLOWED_TAGS_ANNOTATION, CLUSTER_FINALIZER, RECONCILE_DISABLED_ANNOTATION};

// =============================================================================
// PoolCluster CRD
// =============================================================================

/// PoolCluster declares how many pools exist, on which nodes, and which
/// block devices and RAID layout each of them uses.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "PoolCluster",
    plural = "poolclusters",
    shortname = "pc",
    status = "PoolClusterStatus",
    printcolumn = r#"{"name": "Healthy", "type": "integer", "jsonPath": ".status.healthyInstances"}"#,
    printcolumn = r#"{"name": "Provisioned", "type": "integer", "jsonPath": ".status.provisionedInstances"}"#,
    printcolumn = r#"{"name": "Desired", "type": "integer", "jsonPath": ".status.desiredInstances"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PoolClusterSpec {
    /// One entry per desired pool
    #[serde(default)]
    pub pools: Vec<PoolSpec>,

    /// Resources applied to every runtime manager unless the pool overrides them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_resources: Option<ResourceSpec>,

    /// Tolerations applied to every runtime manager unless the pool overrides them
    #[serde(default)]
    pub default_tolerations: Vec<TolerationSpec>,

    /// Priority class applied to every runtime manager unless the pool overrides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_priority_class_name: Option<String>,

    /// Software version requested for the fleet
    #[serde(default)]
    pub version_details: DesiredVersion,
}

/// One desired pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Label selector resolving to exactly one node
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Pool configuration
    pub pool_config: PoolConfig,

    /// Data raid groups
    #[serde(default)]
    pub data_raid_groups: Vec<RaidGroup>,

    /// Write-cache raid groups
    #[serde(default)]
    pub write_cache_raid_groups: Vec<RaidGroup>,
}

impl PoolSpec {
    /// Every block device referenced by this pool
    pub fn device_names(&self) -> BTreeSet<&str> {
        self.data_raid_groups
            .iter()
            .chain(self.write_cache_raid_groups.iter())
            .flat_map(|g| g.block_devices.iter())
            .map(|bd| bd.block_device_name.as_str())
            .collect()
    }
}

/// Requested software version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DesiredVersion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the PoolCluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolClusterStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Number of observed pool instances
    #[serde(default)]
    pub provisioned_instances: u32,

    /// Number of pools in the spec
    #[serde(default)]
    pub desired_instances: u32,

    /// Instances that are online with an available runtime manager
    #[serde(default)]
    pub healthy_instances: u32,

    /// Running software version
    #[serde(default)]
    pub version_details: CurrentVersion,

    /// Last reconcile time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_reconcile_time: Option<DateTime<Utc>>,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Running software version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CurrentVersion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
}

/// Cluster lifecycle phase as published in status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Provisioning,
    Online,
    Degraded,
    Upgrading,
    Deleting,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Provisioning => write!(f, "Provisioning"),
            ClusterPhase::Online => write!(f, "Online"),
            ClusterPhase::Degraded => write!(f, "Degraded"),
            ClusterPhase::Upgrading => write!(f, "Upgrading"),
            ClusterPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl PoolCluster {
    /// Build a cluster object with the given pools
    pub fn with_pools(name: &str, namespace: &str, pools: Vec<PoolSpec>) -> Self {
        let mut cluster = PoolCluster::new(
            name,
            PoolClusterSpec {
                pools,
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some(namespace.to_string());
        cluster
    }

    /// Namespace of the cluster
    pub fn ns(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Reconciliation is switched off through an annotation
    pub fn is_reconcile_disabled(&self) -> bool {
        self.annotations()
            .get(RECONCILE_DISABLED_ANNOTATION)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Block device tags that may be claimed, when a whitelist is set
    pub fn allowed_tags(&self) -> Option<BTreeSet<String>> {
        self.annotations().get(ALLOWED_TAGS_ANNOTATION).map(|tags| {
            tags.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == CLUSTER_FINALIZER)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Currently running version, if recorded
    pub fn current_version(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.version_details.current.as_deref())
    }

    /// An upgrade is pending while the desired version differs from the running one
    pub fn upgrade_in_progress(&self) -> bool {
        match (self.spec.version_details.desired.as_deref(), self.current_version()) {
            (Some(desired), Some(current)) => desired != current,
            _ => false,
        }
    }

    /// Every block device referenced anywhere in the spec
    pub fn device_names(&self) -> BTreeSet<&str> {
        self.spec
            .pools
            .iter()
            .flat_map(|p| p.device_names())
            .collect()
    }
}
