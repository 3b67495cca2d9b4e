//! BlockDevice and BlockDeviceClaim CRDs
//!
//! BlockDevices are published by the node disk directory; a
//! BlockDeviceClaim binds one device to one PoolCluster.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{BLOCK_DEVICE_TAG_LABEL, CLUSTER_NAME_LABEL};
use crate::error::{Error, Result};

// =============================================================================
// BlockDevice CRD
// =============================================================================

/// A physical block device discovered on a node.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "BlockDevice",
    plural = "blockdevices",
    shortname = "bd",
    status = "BlockDeviceStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Size", "type": "string", "jsonPath": ".spec.capacity.storage"}"#,
    printcolumn = r#"{"name": "ClaimState", "type": "string", "jsonPath": ".status.claimState"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    /// Node the device is attached to
    pub node_name: String,

    /// Device path (e.g. /dev/sdb)
    #[serde(default)]
    pub path: String,

    /// Capacity information
    #[serde(default)]
    pub capacity: DeviceCapacity,

    /// Existing filesystem on the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FileSystemInfo>,

    /// Claim bound to this device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ClaimReference>,
}

/// Device capacity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapacity {
    /// Capacity as a quantity string (e.g. "100Gi")
    #[serde(default)]
    pub storage: String,
}

/// Filesystem found on a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemInfo {
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub mount_point: Option<String>,
}

/// Reference from a device to the claim bound to it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReference {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Status of a block device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatus {
    #[serde(default)]
    pub claim_state: ClaimState,
    #[serde(default)]
    pub state: DeviceState,
}

/// Claim state of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClaimState {
    #[default]
    Unclaimed,
    Claimed,
    ReplacementPending,
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimState::Unclaimed => write!(f, "Unclaimed"),
            ClaimState::Claimed => write!(f, "Claimed"),
            ClaimState::ReplacementPending => write!(f, "ReplacementPending"),
        }
    }
}

/// Availability of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeviceState {
    Active,
    Inactive,
    #[default]
    Unknown,
}

// =============================================================================
// BlockDeviceClaim CRD
// =============================================================================

/// Binding of one BlockDevice to one PoolCluster.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "BlockDeviceClaim",
    plural = "blockdeviceclaims",
    shortname = "bdc",
    printcolumn = r#"{"name": "BlockDevice", "type": "string", "jsonPath": ".spec.blockDeviceName"}"#,
    printcolumn = r#"{"name": "Predecessor", "type": "string", "jsonPath": ".spec.predecessorDevice"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimSpec {
    /// Device bound by this claim
    pub block_device_name: String,

    /// Node of the device
    #[serde(default)]
    pub node_name: String,

    /// Requested storage in bytes
    #[serde(default)]
    pub requested_storage: u64,

    /// Device this claim is replacing, cleared once the replacement completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor_device: Option<String>,
}

// =============================================================================
// Implementations
// =============================================================================

impl BlockDevice {
    /// Tag label of the device, if any
    pub fn tag(&self) -> Option<&str> {
        self.labels().get(BLOCK_DEVICE_TAG_LABEL).map(String::as_str)
    }

    pub fn claim_state(&self) -> ClaimState {
        self.status
            .as_ref()
            .map(|s| s.claim_state)
            .unwrap_or_default()
    }

    pub fn is_claimed(&self) -> bool {
        self.claim_state() != ClaimState::Unclaimed
    }

    pub fn is_active(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.state == DeviceState::Active)
            .unwrap_or(false)
    }

    /// A device carrying a filesystem must not be consumed by a pool
    pub fn has_filesystem(&self) -> bool {
        self.spec
            .filesystem
            .as_ref()
            .map(|fs| fs.fs_type.as_deref().map(|t| !t.is_empty()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Parsed capacity in bytes
    pub fn capacity_bytes(&self) -> Result<u64> {
        parse_capacity(&self.spec.capacity.storage)
            .map_err(|e| Error::CapacityParse(format!("block device {}: {}", self.name_any(), e)))
    }

    /// Name of the claim that would bind this device
    pub fn claim_name(&self) -> String {
        match self.uid() {
            Some(uid) => format!("bdc-{}", uid),
            None => format!("bdc-{}", self.name_any()),
        }
    }
}

impl BlockDeviceClaim {
    /// Name of the owning PoolCluster, from the cluster-name label
    pub fn cluster_name(&self) -> Option<&str> {
        self.labels().get(CLUSTER_NAME_LABEL).map(String::as_str)
    }

    pub fn is_owned_by(&self, cluster: &str) -> bool {
        self.cluster_name() == Some(cluster)
    }

    pub fn predecessor(&self) -> Option<&str> {
        self.spec.predecessor_device.as_deref()
    }

    /// Claim state derived from the predecessor field
    pub fn state(&self) -> ClaimState {
        if self.spec.predecessor_device.is_some() {
            ClaimState::ReplacementPending
        } else {
            ClaimState::Claimed
        }
    }
}

/// Parse a capacity quantity string (e.g. "100Gi", "1T", "512") into bytes
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }

    // Find where the number ends and unit begins
    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;

    let multiplier: u64 = match unit_str {
        "" => 1,
        "k" | "K" => 1000,
        "M" => 1000u64.pow(2),
        "G" => 1000u64.pow(3),
        "T" => 1000u64.pow(4),
        "P" => 1000u64.pow(5),
        "Ki" => 1024,
        "Mi" => 1024u64.pow(2),
        "Gi" => 1024u64.pow(3),
        "Ti" => 1024u64.pow(4),
        "Pi" => 1024u64.pow(5),
        _ => {
            return Err(Error::CapacityParse(format!(
                "unknown unit: {}",
                unit_str
            )))
        }
    };

    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_capacity() {
        assert_eq!(parse_capacity("100").unwrap(), 100);
        assert_eq!(parse_capacity("1k").unwrap(), 1000);
        assert_eq!(parse_capacity("1Ki").unwrap(), 1024);
        assert_eq!(parse_capacity("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_capacity("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_capacity("100Gi").unwrap(), 100 * 1024 * 1024 * 1024);
        assert_eq!(parse_capacity("1.5Ti").unwrap(), 3 * 1024u64.pow(4) / 2);

        assert!(parse_capacity("").is_err());
        assert!(parse_capacity("abc").is_err());
        assert!(parse_capacity("100X").is_err());
    }

    #[test]
    fn test_device_helpers() {
        let mut bd = BlockDevice::new(
            "bd-1",
            BlockDeviceSpec {
                node_name: "worker-1".into(),
                path: "/dev/sdb".into(),
                capacity: DeviceCapacity {
                    storage: "10Gi".into(),
                },
                filesystem: None,
                claim_ref: None,
            },
        );
        assert_eq!(bd.claim_name(), "bdc-bd-1");
        assert!(!bd.is_active());
        assert!(!bd.has_filesystem());
        assert_eq!(bd.capacity_bytes().unwrap(), 10 * 1024 * 1024 * 1024);

        bd.metadata.uid = Some("1234-abcd".into());
        bd.metadata.labels = Some(BTreeMap::from([(
            BLOCK_DEVICE_TAG_LABEL.to_string(),
            "fast".to_string(),
        )]));
        bd.spec.filesystem = Some(FileSystemInfo {
            fs_type: Some("ext4".into()),
            mount_point: None,
        });
        assert_eq!(bd.claim_name(), "bdc-1234-abcd");
        assert_eq!(bd.tag(), Some("fast"));
        assert!(bd.has_filesystem());
    }

    #[test]
    fn test_claim_state_from_predecessor() {
        let mut claim = BlockDeviceClaim::new(
            "bdc-1",
            BlockDeviceClaimSpec {
                block_device_name: "bd-3".into(),
                node_name: "worker-1".into(),
                requested_storage: 1024,
                predecessor_device: None,
            },
        );
        assert_eq!(claim.state(), ClaimState::Claimed);
        claim.spec.predecessor_device = Some("bd-2".into());
        assert_eq!(claim.state(), ClaimState::ReplacementPending);
        assert_eq!(claim.predecessor(), Some("bd-2"));
    }
}
