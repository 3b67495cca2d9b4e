//! Shared topology types
//!
//! RAID groups, pool configuration and conditions shared by the desired
//! (PoolCluster) and observed (PoolInstance) resources.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use crate::error::Error;

// =============================================================================
// RAID Type
// =============================================================================

/// RAID layout of a group of block devices
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum RaidType {
    #[default]
    Stripe,
    Mirror,
    Raidz,
    Raidz2,
}

/// Device-count requirement of a RAID type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    AtLeast(usize),
    Exactly(usize),
}

impl RaidType {
    /// Device-count requirement for one group of this type
    pub fn arity(&self) -> Arity {
        match self {
            RaidType::Stripe => Arity::AtLeast(1),
            RaidType::Mirror => Arity::Exactly(2),
            RaidType::Raidz => Arity::Exactly(3),
            RaidType::Raidz2 => Arity::Exactly(6),
        }
    }

    /// Whether a group with `count` devices satisfies the arity
    pub fn accepts(&self, count: usize) -> bool {
        match self.arity() {
            Arity::AtLeast(min) => count >= min,
            Arity::Exactly(n) => count == n,
        }
    }

    pub fn is_stripe(&self) -> bool {
        matches!(self, RaidType::Stripe)
    }
}

impl std::fmt::Display for RaidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaidType::Stripe => write!(f, "stripe"),
            RaidType::Mirror => write!(f, "mirror"),
            RaidType::Raidz => write!(f, "raidz"),
            RaidType::Raidz2 => write!(f, "raidz2"),
        }
    }
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::AtLeast(n) => write!(f, "at least {}", n),
            Arity::Exactly(n) => write!(f, "exactly {}", n),
        }
    }
}

impl FromStr for RaidType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stripe" => Ok(RaidType::Stripe),
            "mirror" => Ok(RaidType::Mirror),
            "raidz" => Ok(RaidType::Raidz),
            "raidz2" => Ok(RaidType::Raidz2),
            other => Err(Error::StructuralViolation(format!(
                "unsupported raid type {}",
                other
            ))),
        }
    }
}

// =============================================================================
// RAID Group
// =============================================================================

/// Reference to a block device inside a raid group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceRef {
    /// Name of the BlockDevice resource
    pub block_device_name: String,

    /// Device link resolved by the runtime manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_link: Option<String>,
}

impl BlockDeviceRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            block_device_name: name.into(),
            dev_link: None,
        }
    }
}

/// A set of block devices combined under one RAID policy.
/// Order carries no meaning; groups are matched by device overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RaidGroup {
    #[serde(default)]
    pub block_devices: Vec<BlockDeviceRef>,
}

impl RaidGroup {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            block_devices: names.into_iter().map(BlockDeviceRef::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.block_devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_devices.is_empty()
    }

    pub fn device_names(&self) -> BTreeSet<&str> {
        self.block_devices
            .iter()
            .map(|bd| bd.block_device_name.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.block_devices
            .iter()
            .any(|bd| bd.block_device_name == name)
    }
}

// =============================================================================
// Pool Configuration
// =============================================================================

/// Compute resources for the runtime manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// Toleration applied to the runtime manager pod
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TolerationSpec {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub effect: Option<String>,
    #[serde(default)]
    pub toleration_seconds: Option<i64>,
}

/// Pool-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// RAID layout of the data raid groups
    pub data_raid_group_type: RaidType,

    /// RAID layout of the write-cache raid groups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_cache_group_type: Option<RaidType>,

    /// Reserve the whole capacity up front
    #[serde(default)]
    pub thick_provision: bool,

    /// Compression algorithm (e.g. lz4, off)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,

    /// Used-capacity percentage at which the pool turns read-only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ro_threshold_limit: Option<u8>,

    /// Resources for the runtime manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,

    /// Tolerations for the runtime manager
    #[serde(default)]
    pub tolerations: Vec<TolerationSpec>,

    /// Priority class for the runtime manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

// =============================================================================
// Conditions
// =============================================================================

/// Status condition shared by the pool resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: String,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Message
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(r#type: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Insert or replace a condition, keeping the previous transition time
/// when the status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.r#type == condition.r#type)
    {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raid_arity() {
        assert!(RaidType::Stripe.accepts(1));
        assert!(RaidType::Stripe.accepts(7));
        assert!(!RaidType::Stripe.accepts(0));

        assert!(RaidType::Mirror.accepts(2));
        assert!(!RaidType::Mirror.accepts(1));
        assert!(!RaidType::Mirror.accepts(4));

        assert!(RaidType::Raidz.accepts(3));
        assert!(!RaidType::Raidz.accepts(2));
        assert!(!RaidType::Raidz.accepts(6));

        assert!(RaidType::Raidz2.accepts(6));
        assert!(!RaidType::Raidz2.accepts(3));
        assert!(!RaidType::Raidz2.accepts(7));
    }

    #[test]
    fn test_raid_type_parse_and_display() {
        assert_eq!("Mirror".parse::<RaidType>().unwrap(), RaidType::Mirror);
        assert_eq!(RaidType::Raidz2.to_string(), "raidz2");
        assert!("raid10".parse::<RaidType>().is_err());
    }

    #[test]
    fn test_raid_group_membership() {
        let group = RaidGroup::new(["bd-1", "bd-2"]);
        assert_eq!(group.len(), 2);
        assert!(group.contains("bd-1"));
        assert!(!group.contains("bd-3"));
        assert_eq!(group.device_names().into_iter().collect::<Vec<_>>(), vec!["bd-1", "bd-2"]);
    }

    #[test]
    fn test_set_condition_preserves_transition_time() {
        let mut conditions = Vec::new();
        let mut first = Condition::new("PoolManagerAvailable", true, "AllAvailable", "ok");
        let stamp = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        first.last_transition_time = Some(stamp);
        set_condition(&mut conditions, first);

        set_condition(
            &mut conditions,
            Condition::new("PoolManagerAvailable", true, "AllAvailable", "still ok"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, Some(stamp));
        assert_eq!(conditions[0].message.as_deref(), Some("still ok"));

        set_condition(
            &mut conditions,
            Condition::new("PoolManagerAvailable", false, "Unavailable", "down"),
        );
        assert_ne!(conditions[0].last_transition_time, Some(stamp));
        assert!(!conditions[0].is_true());
    }
}
