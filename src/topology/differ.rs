//! Topology diffing
//!
//! Raid groups are matched by device overlap, never by index. A matched
//! group is then classified as unchanged, a single-device replacement, a
//! stripe expansion, or a change that is not allowed. Desired groups without
//! a match are new groups.

use std::collections::BTreeSet;
use std::fmt;

use crate::crd::{BlockDeviceRef, PoolConfig, PoolInstanceSpec, PoolSpec, RaidGroup, RaidType};

/// Which group list of a pool a group belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Data,
    WriteCache,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKind::Data => write!(f, "data"),
            GroupKind::WriteCache => write!(f, "write-cache"),
        }
    }
}

/// Difference between a desired group and the observed group it matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupChange {
    Unchanged,
    /// Exactly one device swapped in a fixed-arity group
    Replacement { old: String, new: String },
    /// Devices appended to a stripe group
    StripeExpansion { added: Vec<String> },
    Disallowed(String),
}

/// A matched pair of groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDiff {
    pub kind: GroupKind,
    pub desired_index: usize,
    pub observed_index: usize,
    pub change: GroupChange,
}

/// A desired group with no observed counterpart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGroup {
    pub kind: GroupKind,
    pub desired_index: usize,
}

/// Full difference between desired and observed topology of one pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyDiff {
    pub groups: Vec<GroupDiff>,
    pub new_groups: Vec<NewGroup>,
    /// Changes that can never be applied, in detection order
    pub violations: Vec<String>,
}

impl TopologyDiff {
    pub fn is_noop(&self) -> bool {
        self.new_groups.is_empty()
            && self.violations.is_empty()
            && self
                .groups
                .iter()
                .all(|g| g.change == GroupChange::Unchanged)
    }

    pub fn replacements(&self) -> impl Iterator<Item = (&GroupDiff, &str, &str)> {
        self.groups.iter().filter_map(|g| match &g.change {
            GroupChange::Replacement { old, new } => Some((g, old.as_str(), new.as_str())),
            _ => None,
        })
    }

    pub fn stripe_expansions(&self) -> impl Iterator<Item = (&GroupDiff, &[String])> {
        self.groups.iter().filter_map(|g| match &g.change {
            GroupChange::StripeExpansion { added } => Some((g, added.as_slice())),
            _ => None,
        })
    }

    /// First thing that makes the diff inapplicable
    pub fn first_violation(&self) -> Option<&str> {
        self.violations.first().map(String::as_str).or_else(|| {
            self.groups.iter().find_map(|g| match &g.change {
                GroupChange::Disallowed(reason) => Some(reason.as_str()),
                _ => None,
            })
        })
    }
}

/// True if any device of `desired` also appears in `observed`
pub fn raid_group_present(desired: &RaidGroup, observed: &RaidGroup) -> bool {
    desired
        .block_devices
        .iter()
        .any(|bd| observed.contains(&bd.block_device_name))
}

fn format_devices(devices: &BTreeSet<&str>) -> String {
    devices.iter().copied().collect::<Vec<_>>().join(", ")
}

/// Classify the change between a desired group and its matched observed group
pub fn classify_group(raid_type: RaidType, desired: &RaidGroup, observed: &RaidGroup) -> GroupChange {
    let wanted = desired.device_names();
    let current = observed.device_names();
    let added: BTreeSet<&str> = wanted.difference(&current).copied().collect();
    let removed: BTreeSet<&str> = current.difference(&wanted).copied().collect();

    if raid_type.is_stripe() {
        if !removed.is_empty() {
            return GroupChange::Disallowed(format!(
                "devices {} cannot be removed or replaced in a stripe raid group",
                format_devices(&removed)
            ));
        }
        if added.is_empty() {
            return GroupChange::Unchanged;
        }
        // keep the desired order for the appended devices
        let added = desired
            .block_devices
            .iter()
            .map(|bd| bd.block_device_name.clone())
            .filter(|name| added.contains(name.as_str()))
            .collect();
        return GroupChange::StripeExpansion { added };
    }

    match (removed.len(), added.len()) {
        (0, 0) => GroupChange::Unchanged,
        (1, 1) => GroupChange::Replacement {
            old: removed.iter().next().map(|s| s.to_string()).unwrap_or_default(),
            new: added.iter().next().map(|s| s.to_string()).unwrap_or_default(),
        },
        (0, _) => GroupChange::Disallowed(format!(
            "devices {} cannot be added to an existing {} raid group",
            format_devices(&added),
            raid_type
        )),
        (_, 0) => GroupChange::Disallowed(format!(
            "devices {} cannot be removed from a {} raid group",
            format_devices(&removed),
            raid_type
        )),
        _ => GroupChange::Disallowed(format!(
            "only one device of a {} raid group can be replaced at a time, got {} changes",
            raid_type,
            added.len().max(removed.len())
        )),
    }
}

/// Match and classify one list of groups, appending into `diff`
pub fn diff_groups(
    kind: GroupKind,
    raid_type: RaidType,
    desired: &[RaidGroup],
    observed: &[RaidGroup],
    diff: &mut TopologyDiff,
) {
    let mut matched = vec![false; observed.len()];

    for (desired_index, group) in desired.iter().enumerate() {
        let found = observed
            .iter()
            .enumerate()
            .find(|(i, obs)| !matched[*i] && raid_group_present(group, obs));

        match found {
            Some((observed_index, obs)) => {
                matched[observed_index] = true;
                diff.groups.push(GroupDiff {
                    kind,
                    desired_index,
                    observed_index,
                    change: classify_group(raid_type, group, obs),
                });
            }
            None => diff.new_groups.push(NewGroup {
                kind,
                desired_index,
            }),
        }
    }

    for (index, obs) in observed.iter().enumerate() {
        if !matched[index] {
            diff.violations.push(format!(
                "{} raid group with devices {} cannot be removed",
                kind,
                format_devices(&obs.device_names())
            ));
        }
    }
}

fn diff_topology(
    desired_config: &PoolConfig,
    desired_data: &[RaidGroup],
    desired_cache: &[RaidGroup],
    observed_config: &PoolConfig,
    observed_data: &[RaidGroup],
    observed_cache: &[RaidGroup],
) -> TopologyDiff {
    let mut diff = TopologyDiff::default();

    if desired_config.data_raid_group_type != observed_config.data_raid_group_type {
        diff.violations.push(format!(
            "data raid group type cannot change from {} to {}",
            observed_config.data_raid_group_type, desired_config.data_raid_group_type
        ));
    }
    if !observed_cache.is_empty()
        && desired_config.write_cache_group_type != observed_config.write_cache_group_type
    {
        diff.violations.push(format!(
            "write-cache raid group type cannot change from {} to {}",
            observed_config.write_cache_group_type.unwrap_or_default(),
            desired_config.write_cache_group_type.unwrap_or_default()
        ));
    }

    diff_groups(
        GroupKind::Data,
        desired_config.data_raid_group_type,
        desired_data,
        observed_data,
        &mut diff,
    );
    diff_groups(
        GroupKind::WriteCache,
        desired_config.write_cache_group_type.unwrap_or_default(),
        desired_cache,
        observed_cache,
        &mut diff,
    );
    diff
}

/// Difference between a desired pool and the instance realizing it
pub fn diff_pool(desired: &PoolSpec, observed: &PoolInstanceSpec) -> TopologyDiff {
    diff_topology(
        &desired.pool_config,
        &desired.data_raid_groups,
        &desired.write_cache_raid_groups,
        &observed.pool_config,
        &observed.data_raid_groups,
        &observed.write_cache_raid_groups,
    )
}

/// Difference between two revisions of the same desired pool
pub fn diff_specs(new: &PoolSpec, old: &PoolSpec) -> TopologyDiff {
    diff_topology(
        &new.pool_config,
        &new.data_raid_groups,
        &new.write_cache_raid_groups,
        &old.pool_config,
        &old.data_raid_groups,
        &old.write_cache_raid_groups,
    )
}

/// Group list of the given kind
pub fn groups_mut(spec: &mut PoolInstanceSpec, kind: GroupKind) -> &mut Vec<RaidGroup> {
    match kind {
        GroupKind::Data => &mut spec.data_raid_groups,
        GroupKind::WriteCache => &mut spec.write_cache_raid_groups,
    }
}

pub fn desired_groups(pool: &PoolSpec, kind: GroupKind) -> &[RaidGroup] {
    match kind {
        GroupKind::Data => &pool.data_raid_groups,
        GroupKind::WriteCache => &pool.write_cache_raid_groups,
    }
}

/// Swap `old` for `new` in place, keeping the device position
pub fn replace_device(group: &mut RaidGroup, old: &str, new: &str) -> bool {
    match group
        .block_devices
        .iter_mut()
        .find(|bd| bd.block_device_name == old)
    {
        Some(slot) => {
            *slot = BlockDeviceRef::new(new);
            true
        }
        None => false,
    }
}

/// Copy tunables from desired to observed config. Returns whether anything changed.
///
/// RAID types are never synced; the write-cache type is only filled in when
/// the instance had none.
pub fn sync_config(desired: &PoolConfig, observed: &mut PoolConfig) -> bool {
    let before = observed.clone();

    observed.ro_threshold_limit = desired.ro_threshold_limit;
    observed.compression = desired.compression.clone();
    observed.thick_provision = desired.thick_provision;
    observed.resources = desired.resources.clone();
    observed.tolerations = desired.tolerations.clone();
    observed.priority_class_name = desired.priority_class_name.clone();
    if observed.write_cache_group_type.is_none() {
        observed.write_cache_group_type = desired.write_cache_group_type;
    }

    *observed != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pool(raid_type: RaidType, groups: Vec<RaidGroup>) -> PoolSpec {
        PoolSpec {
            node_selector: BTreeMap::new(),
            pool_config: PoolConfig {
                data_raid_group_type: raid_type,
                ..Default::default()
            },
            data_raid_groups: groups,
            write_cache_raid_groups: vec![],
        }
    }

    #[test]
    fn test_group_presence_by_overlap() {
        let a = RaidGroup::new(["bd-1", "bd-2"]);
        assert!(raid_group_present(&RaidGroup::new(["bd-2", "bd-9"]), &a));
        assert!(!raid_group_present(&RaidGroup::new(["bd-8", "bd-9"]), &a));
    }

    #[test]
    fn test_mirror_single_replacement() {
        let change = classify_group(
            RaidType::Mirror,
            &RaidGroup::new(["bd-1", "bd-3"]),
            &RaidGroup::new(["bd-1", "bd-2"]),
        );
        assert_eq!(
            change,
            GroupChange::Replacement {
                old: "bd-2".into(),
                new: "bd-3".into()
            }
        );
    }

    #[test]
    fn test_fixed_arity_changes_disallowed() {
        let observed = RaidGroup::new(["bd-1", "bd-2", "bd-3"]);
        let shrink = classify_group(RaidType::Raidz, &RaidGroup::new(["bd-1", "bd-2"]), &observed);
        assert!(matches!(shrink, GroupChange::Disallowed(_)));

        let grow = classify_group(
            RaidType::Raidz,
            &RaidGroup::new(["bd-1", "bd-2", "bd-3", "bd-4"]),
            &observed,
        );
        assert!(matches!(grow, GroupChange::Disallowed(_)));

        let double = classify_group(
            RaidType::Raidz,
            &RaidGroup::new(["bd-1", "bd-8", "bd-9"]),
            &observed,
        );
        assert!(matches!(double, GroupChange::Disallowed(m) if m.contains("one device")));
    }

    #[test]
    fn test_stripe_only_grows() {
        let observed = RaidGroup::new(["bd-1"]);
        assert_eq!(
            classify_group(RaidType::Stripe, &RaidGroup::new(["bd-1", "bd-2", "bd-3"]), &observed),
            GroupChange::StripeExpansion {
                added: vec!["bd-2".into(), "bd-3".into()]
            }
        );
        assert!(matches!(
            classify_group(
                RaidType::Stripe,
                &RaidGroup::new(["bd-2"]),
                &RaidGroup::new(["bd-1", "bd-2"])
            ),
            GroupChange::Disallowed(_)
        ));
    }

    #[test]
    fn test_diff_specs_detects_new_and_removed_groups() {
        let old = pool(RaidType::Mirror, vec![RaidGroup::new(["bd-1", "bd-2"])]);
        let grown = pool(
            RaidType::Mirror,
            vec![
                RaidGroup::new(["bd-2", "bd-1"]),
                RaidGroup::new(["bd-3", "bd-4"]),
            ],
        );
        let diff = diff_specs(&grown, &old);
        assert_eq!(diff.groups.len(), 1);
        assert_eq!(diff.groups[0].change, GroupChange::Unchanged);
        assert_eq!(
            diff.new_groups,
            vec![NewGroup {
                kind: GroupKind::Data,
                desired_index: 1
            }]
        );
        assert!(diff.violations.is_empty());

        let shrunk = diff_specs(&old, &grown);
        assert_eq!(shrunk.violations.len(), 1);
        assert!(shrunk.first_violation().unwrap().contains("cannot be removed"));
    }

    #[test]
    fn test_raid_type_change_is_a_violation() {
        let old = pool(RaidType::Mirror, vec![RaidGroup::new(["bd-1", "bd-2"])]);
        let new = pool(RaidType::Stripe, vec![RaidGroup::new(["bd-1", "bd-2"])]);
        let diff = diff_specs(&new, &old);
        assert!(diff.first_violation().unwrap().contains("type cannot change"));
    }

    #[test]
    fn test_unchanged_is_noop() {
        let old = pool(RaidType::Stripe, vec![RaidGroup::new(["bd-1"])]);
        assert!(diff_specs(&old, &old).is_noop());
    }

    #[test]
    fn test_replace_device_in_place() {
        let mut group = RaidGroup::new(["bd-1", "bd-2"]);
        assert!(replace_device(&mut group, "bd-1", "bd-3"));
        assert_eq!(group.block_devices[0].block_device_name, "bd-3");
        assert!(!replace_device(&mut group, "bd-9", "bd-4"));
    }

    #[test]
    fn test_sync_config() {
        let desired = PoolConfig {
            data_raid_group_type: RaidType::Mirror,
            ro_threshold_limit: Some(85),
            compression: Some("lz4".into()),
            ..Default::default()
        };
        let mut observed = PoolConfig {
            data_raid_group_type: RaidType::Mirror,
            ..Default::default()
        };
        assert!(sync_config(&desired, &mut observed));
        assert_eq!(observed.ro_threshold_limit, Some(85));
        assert!(!sync_config(&desired, &mut observed));
    }
}
