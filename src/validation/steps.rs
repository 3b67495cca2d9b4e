//! Named validation steps
//!
//! Each list is evaluated in declaration order and stops at the first
//! failure. The pure checks live here; steps that need the stores are
//! evaluated by the gate.

use std::collections::BTreeSet;
use std::fmt;

use crate::crd::{PoolCluster, PoolSpec, RaidGroup, RaidType};
use crate::error::{Error, Result};

/// Checks applied to a whole PoolCluster on create and update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralStep {
    NonEmptyPools,
    UniqueDevices,
    DistinctNodes,
    RaidArity,
    DeviceEligibility,
}

impl StructuralStep {
    pub const ORDER: [StructuralStep; 5] = [
        StructuralStep::NonEmptyPools,
        StructuralStep::UniqueDevices,
        StructuralStep::DistinctNodes,
        StructuralStep::RaidArity,
        StructuralStep::DeviceEligibility,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StructuralStep::NonEmptyPools => "non-empty-pools",
            StructuralStep::UniqueDevices => "unique-devices",
            StructuralStep::DistinctNodes => "distinct-nodes",
            StructuralStep::RaidArity => "raid-arity",
            StructuralStep::DeviceEligibility => "device-eligibility",
        }
    }
}

/// Checks applied to each pair of matched pools on update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStep {
    RaidTypeUnchanged,
    NoShrink,
    Replacement,
    Expansion,
}

impl UpdateStep {
    pub const ORDER: [UpdateStep; 4] = [
        UpdateStep::RaidTypeUnchanged,
        UpdateStep::NoShrink,
        UpdateStep::Replacement,
        UpdateStep::Expansion,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            UpdateStep::RaidTypeUnchanged => "raid-type-unchanged",
            UpdateStep::NoShrink => "no-shrink",
            UpdateStep::Replacement => "replacement",
            UpdateStep::Expansion => "expansion",
        }
    }
}

impl fmt::Display for StructuralStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn check_non_empty(cluster: &PoolCluster) -> Result<()> {
    if cluster.spec.pools.is_empty() {
        return Err(Error::StructuralViolation(
            "pool cluster must declare at least one pool".into(),
        ));
    }
    Ok(())
}

pub fn check_unique_devices(cluster: &PoolCluster) -> Result<()> {
    let mut seen = BTreeSet::new();
    for (index, pool) in cluster.spec.pools.iter().enumerate() {
        let groups = pool
            .data_raid_groups
            .iter()
            .chain(pool.write_cache_raid_groups.iter());
        for bd in groups.flat_map(|g| g.block_devices.iter()) {
            if !seen.insert(bd.block_device_name.as_str()) {
                return Err(Error::StructuralViolation(format!(
                    "block device {} is used more than once (pool {})",
                    bd.block_device_name, index
                )));
            }
        }
    }
    Ok(())
}

/// Every resolved node appears once
pub fn check_distinct_nodes(nodes: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for node in nodes {
        if !seen.insert(node.as_str()) {
            return Err(Error::StructuralViolation(format!(
                "more than one pool resolves to node {}",
                node
            )));
        }
    }
    Ok(())
}

fn check_groups(index: usize, kind: &str, raid_type: RaidType, groups: &[RaidGroup]) -> Result<()> {
    for (g, group) in groups.iter().enumerate() {
        if !raid_type.accepts(group.len()) {
            return Err(Error::StructuralViolation(format!(
                "pool {} {} raid group {}: {} requires {} devices, got {}",
                index,
                kind,
                g,
                raid_type,
                raid_type.arity(),
                group.len()
            )));
        }
    }
    Ok(())
}

/// Every group satisfies the arity of its RAID type
pub fn check_pool_arity(index: usize, pool: &PoolSpec) -> Result<()> {
    if pool.data_raid_groups.is_empty() {
        return Err(Error::StructuralViolation(format!(
            "pool {} has no data raid groups",
            index
        )));
    }
    check_groups(index, "data", pool.pool_config.data_raid_group_type, &pool.data_raid_groups)?;

    if !pool.write_cache_raid_groups.is_empty() {
        let Some(cache_type) = pool.pool_config.write_cache_group_type else {
            return Err(Error::StructuralViolation(format!(
                "pool {} has write-cache raid groups but no write-cache group type",
                index
            )));
        };
        check_groups(index, "write-cache", cache_type, &pool.write_cache_raid_groups)?;
    }
    Ok(())
}

pub fn check_raid_arity(cluster: &PoolCluster) -> Result<()> {
    cluster
        .spec
        .pools
        .iter()
        .enumerate()
        .try_for_each(|(index, pool)| check_pool_arity(index, pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PoolConfig;
    use assert_matches::assert_matches;
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

    fn devices(n: usize) -> RaidGroup {
        RaidGroup::new((0..n).map(|i| format!("bd-{}", i)))
    }

    #[test]
    fn test_arity_table() {
        for (raid_type, ok) in [
            (RaidType::Mirror, 2),
            (RaidType::Raidz, 3),
            (RaidType::Raidz2, 6),
        ] {
            for n in 1..=8 {
                let result = check_pool_arity(0, &pool(raid_type, vec![devices(n)]));
                assert_eq!(result.is_ok(), n == ok, "{} with {} devices", raid_type, n);
            }
        }
        for n in 1..=8 {
            assert!(check_pool_arity(0, &pool(RaidType::Stripe, vec![devices(n)])).is_ok());
        }
        assert_matches!(
            check_pool_arity(0, &pool(RaidType::Stripe, vec![devices(0)])),
            Err(Error::StructuralViolation(_))
        );
    }

    #[test]
    fn test_write_cache_needs_type() {
        let mut p = pool(RaidType::Stripe, vec![devices(1)]);
        p.write_cache_raid_groups = vec![RaidGroup::new(["wc-1", "wc-2"])];
        assert!(check_pool_arity(0, &p).is_err());

        p.pool_config.write_cache_group_type = Some(RaidType::Mirror);
        assert!(check_pool_arity(0, &p).is_ok());
    }

    #[test]
    fn test_unique_devices_across_pools() {
        let cluster = PoolCluster::with_pools(
            "fleet",
            "openebs",
            vec![
                pool(RaidType::Stripe, vec![RaidGroup::new(["bd-1"])]),
                pool(RaidType::Stripe, vec![RaidGroup::new(["bd-2", "bd-1"])]),
            ],
        );
        assert_matches!(
            check_unique_devices(&cluster),
            Err(Error::StructuralViolation(m)) if m.contains("bd-1")
        );
    }

    #[test]
    fn test_empty_and_distinct() {
        let empty = PoolCluster::with_pools("fleet", "openebs", vec![]);
        assert!(check_non_empty(&empty).is_err());
        assert!(check_distinct_nodes(&["a".into(), "b".into()]).is_ok());
        assert!(check_distinct_nodes(&["a".into(), "a".into()]).is_err());
    }

    #[test]
    fn test_steps_are_ordered() {
        assert_eq!(StructuralStep::ORDER[0], StructuralStep::NonEmptyPools);
        assert_eq!(StructuralStep::ORDER[4].name(), "device-eligibility");
        assert_eq!(UpdateStep::ORDER[0], UpdateStep::RaidTypeUnchanged);
    }
}
