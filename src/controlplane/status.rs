//! Cluster status aggregation

use chrono::Utc;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::crd::{set_condition, ClusterPhase, Condition, PoolCluster, PoolClusterStatus, PoolInstance};
use crate::domain::ports::RuntimeManager;

/// Condition reporting whether every instance has an available manager
pub const POOL_MANAGER_AVAILABLE: &str = "PoolManagerAvailable";

/// Computes cluster health from observed instances and their managers
#[derive(Debug, Clone, Default)]
pub struct StatusAggregator {
    operator_version: Option<String>,
}

impl StatusAggregator {
    /// `operator_version` seeds `versionDetails.current` when it is unset
    pub fn new(operator_version: impl Into<String>) -> Self {
        Self {
            operator_version: Some(operator_version.into()),
        }
    }

    pub fn compute(
        &self,
        cluster: &PoolCluster,
        instances: &[PoolInstance],
        managers: &[RuntimeManager],
    ) -> PoolClusterStatus {
        let mut status = cluster.status.clone().unwrap_or_default();

        let available: BTreeMap<&str, bool> = managers
            .iter()
            .map(|m| (m.name.as_str(), m.is_available()))
            .collect();
        let manager_ready = |pi: &PoolInstance| {
            available
                .get(pi.name_any().as_str())
                .copied()
                .unwrap_or(false)
        };

        let provisioned = instances.len() as u32;
        let desired = cluster.spec.pools.len() as u32;
        let healthy = instances
            .iter()
            .filter(|pi| pi.is_online() && manager_ready(pi))
            .count() as u32;

        status.provisioned_instances = provisioned;
        status.desired_instances = desired;
        status.healthy_instances = healthy;

        if status.version_details.current.is_none() {
            status.version_details.current = self.operator_version.clone();
        }

        let missing: Vec<String> = instances
            .iter()
            .filter(|pi| !manager_ready(pi))
            .map(|pi| pi.name_any())
            .collect();
        let condition = if instances.is_empty() {
            Condition::new(POOL_MANAGER_AVAILABLE, false, "NoInstances", "no pool instances provisioned")
        } else if missing.is_empty() {
            Condition::new(
                POOL_MANAGER_AVAILABLE,
                true,
                "AllManagersAvailable",
                format!("{} pool managers available", instances.len()),
            )
        } else {
            Condition::new(
                POOL_MANAGER_AVAILABLE,
                false,
                "ManagersUnavailable",
                format!("pool managers not available: {}", missing.join(", ")),
            )
        };
        set_condition(&mut status.conditions, condition);

        status.phase = phase(cluster, provisioned, desired, healthy);
        status.last_reconcile_time = Some(Utc::now());
        status
    }
}

fn phase(cluster: &PoolCluster, provisioned: u32, desired: u32, healthy: u32) -> ClusterPhase {
    if cluster.is_deleting() {
        ClusterPhase::Deleting
    } else if cluster.upgrade_in_progress() {
        ClusterPhase::Upgrading
    } else if provisioned == 0 {
        ClusterPhase::Pending
    } else if provisioned < desired {
        ClusterPhase::Provisioning
    } else if healthy == desired && provisioned == desired {
        ClusterPhase::Online
    } else {
        ClusterPhase::Degraded
    }
}
