//! Object construction
//!
//! Plain constructor functions for PoolInstances and their runtime managers.
//! Cluster-level defaults fill any field the pool leaves unset.

use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::crd::{
    PoolCluster, PoolConfig, PoolInstance, PoolInstanceSpec, PoolSpec, CLUSTER_NAME_LABEL,
    HOSTNAME_LABEL, POOL_PROTECTION_FINALIZER,
};
use crate::domain::ports::RuntimeManager;

/// Inputs for a new PoolInstance
#[derive(Debug, Clone, Copy)]
pub struct InstanceParams<'a> {
    pub cluster: &'a PoolCluster,
    pub pool: &'a PoolSpec,
    pub node_name: &'a str,
}

/// Settings shared by every runtime manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerTemplate {
    pub image: String,
}

impl Default for ManagerTemplate {
    fn default() -> Self {
        Self {
            image: "billyronks/pool-manager:latest".to_string(),
        }
    }
}

/// FNV-1a, stable across processes and releases
fn fnv1a(data: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in data.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Deterministic instance name for a cluster and node
pub fn instance_name(cluster: &str, node_name: &str) -> String {
    format!("{}-{:04x}", cluster, fnv1a(node_name) & 0xffff)
}

/// Pool configuration with cluster defaults applied to unset fields
pub fn effective_config(cluster: &PoolCluster, pool: &PoolSpec) -> PoolConfig {
    let mut config = pool.pool_config.clone();
    if config.resources.is_none() {
        config.resources = cluster.spec.default_resources.clone();
    }
    if config.tolerations.is_empty() {
        config.tolerations = cluster.spec.default_tolerations.clone();
    }
    if config.priority_class_name.is_none() {
        config.priority_class_name = cluster.spec.default_priority_class_name.clone();
    }
    config
}

/// Build the observed-state object for a pool on its resolved node
pub fn build_instance(params: InstanceParams<'_>) -> PoolInstance {
    let InstanceParams {
        cluster,
        pool,
        node_name,
    } = params;

    let mut instance = PoolInstance::new(
        &instance_name(&cluster.name_any(), node_name),
        PoolInstanceSpec {
            host_name: node_name.to_string(),
            node_selector: pool.node_selector.clone(),
            pool_config: effective_config(cluster, pool),
            data_raid_groups: pool.data_raid_groups.clone(),
            write_cache_raid_groups: pool.write_cache_raid_groups.clone(),
        },
    );
    instance.metadata.namespace = Some(cluster.ns());
    instance.metadata.labels = Some(BTreeMap::from([
        (CLUSTER_NAME_LABEL.to_string(), cluster.name_any()),
        (HOSTNAME_LABEL.to_string(), node_name.to_string()),
    ]));
    instance.metadata.finalizers = Some(vec![POOL_PROTECTION_FINALIZER.to_string()]);
    instance.metadata.owner_references = cluster.controller_owner_ref(&()).map(|r| vec![r]);
    instance
}

/// Build the runtime manager operating `instance`
pub fn build_manager(instance: &PoolInstance, template: &ManagerTemplate) -> RuntimeManager {
    let config = &instance.spec.pool_config;
    RuntimeManager {
        name: instance.name_any(),
        namespace: instance.namespace().unwrap_or_default(),
        cluster_name: instance.cluster_name().unwrap_or_default().to_string(),
        node_name: instance.spec.host_name.clone(),
        image: template.image.clone(),
        resources: config.resources.clone(),
        tolerations: config.tolerations.clone(),
        priority_class_name: config.priority_class_name.clone(),
        ready_replicas: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RaidGroup, RaidType, ResourceSpec, TolerationSpec};

    fn cluster() -> PoolCluster {
        let pool = PoolSpec {
            node_selector: BTreeMap::from([(HOSTNAME_LABEL.to_string(), "worker-1".to_string())]),
            pool_config: PoolConfig {
                data_raid_group_type: RaidType::Mirror,
                priority_class_name: Some("pool-critical".into()),
                ..Default::default()
            },
            data_raid_groups: vec![RaidGroup::new(["bd-1", "bd-2"])],
            write_cache_raid_groups: vec![],
        };
        let mut c = PoolCluster::with_pools("fleet", "openebs", vec![pool]);
        c.metadata.uid = Some("uid-fleet".into());
        c.spec.default_resources = Some(ResourceSpec {
            requests: BTreeMap::from([("memory".to_string(), "1Gi".to_string())]),
            limits: BTreeMap::new(),
        });
        c.spec.default_tolerations = vec![TolerationSpec {
            key: Some("storage".into()),
            ..Default::default()
        }];
        c.spec.default_priority_class_name = Some("default-class".into());
        c
    }

    #[test]
    fn test_instance_name_is_deterministic() {
        assert_eq!(instance_name("fleet", "worker-1"), instance_name("fleet", "worker-1"));
        assert_ne!(instance_name("fleet", "worker-1"), instance_name("fleet", "worker-2"));
        assert!(instance_name("fleet", "worker-1").starts_with("fleet-"));
    }

    #[test]
    fn test_build_instance_applies_defaults() {
        let cluster = cluster();
        let instance = build_instance(InstanceParams {
            cluster: &cluster,
            pool: &cluster.spec.pools[0],
            node_name: "worker-1",
        });

        assert_eq!(instance.cluster_name(), Some("fleet"));
        assert_eq!(instance.host_name(), "worker-1");
        assert!(instance.has_protection_finalizer());
        assert_eq!(instance.owner_references()[0].uid, "uid-fleet");
        assert_eq!(instance.spec.data_raid_groups[0].len(), 2);

        let config = &instance.spec.pool_config;
        assert_eq!(config.priority_class_name.as_deref(), Some("pool-critical"));
        assert!(config.resources.is_some());
        assert_eq!(config.tolerations.len(), 1);
    }

    #[test]
    fn test_build_manager() {
        let cluster = cluster();
        let instance = build_instance(InstanceParams {
            cluster: &cluster,
            pool: &cluster.spec.pools[0],
            node_name: "worker-1",
        });
        let manager = build_manager(&instance, &ManagerTemplate::default());

        assert_eq!(manager.name, instance.name_any());
        assert_eq!(manager.cluster_name, "fleet");
        assert_eq!(manager.node_name, "worker-1");
        assert!(!manager.is_available());
    }
}
