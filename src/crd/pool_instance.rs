//! PoolInstance CRD
//!
//! Observed state of one physical pool on one node, owned by a PoolCluster.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::topology::{Condition, PoolConfig, RaidGroup};
use super::{CLUSTER_NAME_LABEL, POOL_PROTECTION_FINALIZER};

// =============================================================================
// PoolInstance CRD
// =============================================================================

/// PoolInstance mirrors the realized topology of a single pool.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "PoolInstance",
    plural = "poolinstances",
    shortname = "pi",
    status = "PoolInstanceStatus",
    printcolumn = r#"{"name": "Host", "type": "string", "jsonPath": ".spec.hostName"}"#,
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.poolConfig.dataRaidGroupType"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "ReadOnly", "type": "boolean", "jsonPath": ".status.readOnly"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PoolInstanceSpec {
    /// Node hosting the pool
    pub host_name: String,

    /// Selector the node was resolved from
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Realized pool configuration
    pub pool_config: PoolConfig,

    /// Realized data raid groups
    #[serde(default)]
    pub data_raid_groups: Vec<RaidGroup>,

    /// Realized write-cache raid groups
    #[serde(default)]
    pub write_cache_raid_groups: Vec<RaidGroup>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the PoolInstance, reported by its runtime manager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolInstanceStatus {
    /// Current phase
    #[serde(default)]
    pub phase: InstancePhase,

    /// Capacity accounting
    #[serde(default)]
    pub capacity: InstanceCapacity,

    /// Pool was switched read-only after crossing its threshold
    #[serde(default)]
    pub read_only: bool,

    /// Devices still resilvering after a replacement
    #[serde(default)]
    pub resilvering_devices: Vec<String>,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Capacity of a pool instance (quantity strings)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCapacity {
    #[serde(default)]
    pub total: String,
    #[serde(default)]
    pub used: String,
    #[serde(default)]
    pub free: String,
}

/// Pool instance phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum InstancePhase {
    #[default]
    Pending,
    Online,
    Degraded,
    Offline,
    Error,
    DeletionFailed,
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstancePhase::Pending => write!(f, "Pending"),
            InstancePhase::Online => write!(f, "Online"),
            InstancePhase::Degraded => write!(f, "Degraded"),
            InstancePhase::Offline => write!(f, "Offline"),
            InstancePhase::Error => write!(f, "Error"),
            InstancePhase::DeletionFailed => write!(f, "DeletionFailed"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl PoolInstance {
    /// Name of the owning PoolCluster, from the cluster-name label
    pub fn cluster_name(&self) -> Option<&str> {
        self.labels().get(CLUSTER_NAME_LABEL).map(String::as_str)
    }

    pub fn host_name(&self) -> &str {
        &self.spec.host_name
    }

    pub fn has_protection_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f == POOL_PROTECTION_FINALIZER)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn phase(&self) -> InstancePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn is_online(&self) -> bool {
        self.phase() == InstancePhase::Online
    }

    /// Whether the device is still being resilvered
    pub fn is_resilvering(&self, device: &str) -> bool {
        self.status
            .as_ref()
            .map(|s| s.resilvering_devices.iter().any(|d| d == device))
            .unwrap_or(false)
    }

    /// Every block device referenced by this instance
    pub fn device_names(&self) -> BTreeSet<&str> {
        self.spec
            .data_raid_groups
            .iter()
            .chain(self.spec.write_cache_raid_groups.iter())
            .flat_map(|g| g.block_devices.iter())
            .map(|bd| bd.block_device_name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::topology::RaidType;

    fn instance() -> PoolInstance {
        let mut pi = PoolInstance::new(
            "fleet-abcd",
            PoolInstanceSpec {
                host_name: "worker-1".into(),
                node_selector: BTreeMap::new(),
                pool_config: PoolConfig {
                    data_raid_group_type: RaidType::Mirror,
                    ..Default::default()
                },
                data_raid_groups: vec![RaidGroup::new(["bd-1", "bd-2"])],
                write_cache_raid_groups: vec![RaidGroup::new(["bd-9"])],
            },
        );
        pi.metadata.labels = Some(BTreeMap::from([(
            CLUSTER_NAME_LABEL.to_string(),
            "fleet".to_string(),
        )]));
        pi
    }

    #[test]
    fn test_labels_and_devices() {
        let pi = instance();
        assert_eq!(pi.cluster_name(), Some("fleet"));
        assert_eq!(pi.device_names().len(), 3);
        assert!(!pi.has_protection_finalizer());
        assert_eq!(pi.phase(), InstancePhase::Pending);
    }

    #[test]
    fn test_resilvering() {
        let mut pi = instance();
        assert!(!pi.is_resilvering("bd-2"));
        pi.status = Some(PoolInstanceStatus {
            phase: InstancePhase::Online,
            resilvering_devices: vec!["bd-2".into()],
            ..Default::default()
        });
        assert!(pi.is_resilvering("bd-2"));
        assert!(pi.is_online());
    }
}
