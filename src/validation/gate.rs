//! Validation gate
//!
//! Runs on every proposed edit before it is persisted. Rejections carry a
//! human readable reason and leave every store untouched; the only side
//! effect of an accepted update is the claim of replacement devices.

use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, instrument, warn};

use super::steps::{self, StructuralStep, UpdateStep};
use crate::crd::{BlockDevice, PoolCluster, PoolSpec};
use crate::domain::ports::Stores;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::topology::differ::{desired_groups, TopologyDiff};
use crate::topology::{diff_specs, ClaimEngine, NodeResolver};

// =============================================================================
// Requests and Verdicts
// =============================================================================

/// Admission operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

/// Object under review
#[derive(Debug, Clone)]
pub enum ReviewTarget {
    PoolCluster {
        old: Option<Box<PoolCluster>>,
        new: Option<Box<PoolCluster>>,
    },
    Namespace(String),
    VolumeConfig,
    VolumeClaim,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub operation: Operation,
    pub target: ReviewTarget,
}

/// Outcome of a review
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl AdmissionVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// A replacement accepted by the update checks, claimed once every check passed
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlannedReplacement {
    old: String,
    new: String,
}

// =============================================================================
// Gate
// =============================================================================

pub struct ValidationGate {
    stores: Stores,
    resolver: NodeResolver,
    claims: ClaimEngine,
}

impl ValidationGate {
    pub fn new(stores: Stores, retry: RetryPolicy) -> Self {
        Self {
            resolver: NodeResolver::new(stores.nodes.clone()),
            claims: ClaimEngine::new(stores.devices.clone(), retry),
            stores,
        }
    }

    /// Dispatch a request by kind and operation
    pub async fn review(&self, request: &ReviewRequest) -> AdmissionVerdict {
        let result = match (&request.target, request.operation) {
            (ReviewTarget::PoolCluster { new: Some(new), .. }, Operation::Create) => {
                self.validate_create(new).await
            }
            (ReviewTarget::PoolCluster { old: Some(old), new: Some(new) }, Operation::Update) => {
                self.validate_update(old, new).await
            }
            (ReviewTarget::PoolCluster { old: Some(old), .. }, Operation::Delete) => {
                self.validate_delete(old).await
            }
            (ReviewTarget::PoolCluster { .. }, op) => Err(Error::StructuralViolation(format!(
                "{:?} request carries no pool cluster object",
                op
            ))),
            (ReviewTarget::Namespace(ns), Operation::Delete) => {
                self.validate_namespace_delete(ns).await
            }
            // No topology constraints on these
            (ReviewTarget::Namespace(_), _)
            | (ReviewTarget::VolumeConfig, _)
            | (ReviewTarget::VolumeClaim, _)
            | (ReviewTarget::Other(_), _) => Ok(()),
        };

        match result {
            Ok(()) => AdmissionVerdict::allow(),
            Err(e) if e.is_admission_rejection() => {
                info!(operation = ?request.operation, reason = %e, "edit rejected");
                AdmissionVerdict::deny(e.to_string())
            }
            Err(e) => {
                warn!(operation = ?request.operation, error = %e, "validation could not complete");
                AdmissionVerdict::deny(format!("validation could not complete: {}", e))
            }
        }
    }

    /// Structural checks on a new cluster
    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    pub async fn validate_create(&self, cluster: &PoolCluster) -> Result<()> {
        self.run_structural(cluster).await.map(|_| ())
    }

    /// Structural checks on the new revision, then per-pool update rules.
    /// Replacement devices are claimed once everything passed.
    #[instrument(skip_all, fields(cluster = %new.name_any()))]
    pub async fn validate_update(&self, old: &PoolCluster, new: &PoolCluster) -> Result<()> {
        // Finalizer and status edits, or an object on its way out
        if new.is_deleting() || old.spec.pools == new.spec.pools {
            return Ok(());
        }

        let new_nodes = self.run_structural(new).await?;
        let pairs = self.common_pools(old, new, &new_nodes).await;
        // Both sides of an unfinished replacement lock their group
        let mut in_flight = self.claims.predecessors_in_flight(new).await?;
        in_flight.extend(self.claims.replacing_devices(new).await?);
        let old_devices: BTreeSet<&str> = old.device_names();

        let mut planned = Vec::new();
        for (old_index, new_index) in pairs {
            let old_pool = &old.spec.pools[old_index];
            let new_pool = &new.spec.pools[new_index];
            let diff = diff_specs(new_pool, old_pool);

            for step in UpdateStep::ORDER {
                debug!(step = %step, pool = new_index, "update check");
                match step {
                    UpdateStep::RaidTypeUnchanged => check_raid_type(old_pool, new_pool)?,
                    UpdateStep::NoShrink => check_no_shrink(&diff)?,
                    UpdateStep::Replacement => {
                        planned.extend(
                            self.check_replacements(new, old_pool, &diff, &old_devices, &in_flight)
                                .await?,
                        );
                    }
                    UpdateStep::Expansion => self.check_expansion(new, new_pool, &diff).await?,
                }
            }
        }

        for replacement in planned {
            self.claims
                .claim_replacement(new, &replacement.new, &replacement.old)
                .await?;
        }
        Ok(())
    }

    /// Deleting a cluster is refused while its instances still host replicas
    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    pub async fn validate_delete(&self, cluster: &PoolCluster) -> Result<()> {
        let ns = cluster.ns();
        let instances = self
            .stores
            .instances
            .list_instances(&ns, &cluster.name_any())
            .await?;
        for instance in instances {
            let replicas = self
                .stores
                .replicas
                .list_replicas(&ns, &instance.name_any())
                .await?;
            if !replicas.is_empty() {
                return Err(Error::StructuralViolation(format!(
                    "pool instance {} still hosts volume replicas: {}",
                    instance.name_any(),
                    replicas.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Deleting a namespace is refused while it holds pool clusters
    pub async fn validate_namespace_delete(&self, namespace: &str) -> Result<()> {
        let clusters = self.stores.clusters.list_clusters(Some(namespace)).await?;
        if clusters.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = clusters.iter().map(|c| c.name_any()).collect();
        Err(Error::StructuralViolation(format!(
            "namespace {} still holds pool clusters: {}",
            namespace,
            names.join(", ")
        )))
    }

    // =========================================================================
    // Structural
    // =========================================================================

    /// Run every structural step; returns the resolved node of each pool
    async fn run_structural(&self, cluster: &PoolCluster) -> Result<Vec<String>> {
        let mut nodes = Vec::with_capacity(cluster.spec.pools.len());
        for step in StructuralStep::ORDER {
            debug!(step = %step, "structural check");
            match step {
                StructuralStep::NonEmptyPools => steps::check_non_empty(cluster)?,
                StructuralStep::UniqueDevices => steps::check_unique_devices(cluster)?,
                StructuralStep::DistinctNodes => {
                    for pool in &cluster.spec.pools {
                        nodes.push(self.resolver.resolve(&pool.node_selector).await?);
                    }
                    steps::check_distinct_nodes(&nodes)?;
                }
                StructuralStep::RaidArity => steps::check_raid_arity(cluster)?,
                StructuralStep::DeviceEligibility => {
                    for (pool, node) in cluster.spec.pools.iter().zip(&nodes) {
                        for name in pool.device_names() {
                            self.check_device_eligible(cluster, name, node).await?;
                        }
                    }
                }
            }
        }
        Ok(nodes)
    }

    async fn check_device_eligible(&self, cluster: &PoolCluster, name: &str, node: &str) -> Result<()> {
        let device = self.stores.devices.get_block_device(&cluster.ns(), name).await?;
        if !device.is_active() {
            return Err(Error::StructuralViolation(format!(
                "block device {} is not active",
                name
            )));
        }
        if device.has_filesystem() {
            return Err(Error::StructuralViolation(format!(
                "block device {} already carries a filesystem",
                name
            )));
        }
        if device.spec.node_name != node {
            return Err(Error::StructuralViolation(format!(
                "block device {} is on node {}, not {}",
                name, device.spec.node_name, node
            )));
        }
        self.claims.is_usable(cluster, &device).await?;
        Ok(())
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Pair old and new pools, by resolved node first and by shared devices
    /// when the old pool no longer resolves.
    ///
    /// A pool whose node and devices both changed in the same edit is not
    /// paired and is treated as a brand-new pool.
    async fn common_pools(
        &self,
        old: &PoolCluster,
        new: &PoolCluster,
        new_nodes: &[String],
    ) -> Vec<(usize, usize)> {
        let by_node: BTreeMap<&str, usize> = new_nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let mut taken = HashSet::new();
        let mut pairs = Vec::new();

        for (old_index, old_pool) in old.spec.pools.iter().enumerate() {
            let matched = match self.resolver.resolve(&old_pool.node_selector).await {
                Ok(node) => by_node.get(node.as_str()).copied(),
                Err(e) => {
                    debug!(pool = old_index, error = %e, "old pool no longer resolves, matching by devices");
                    let devices = old_pool.device_names();
                    new.spec.pools.iter().position(|p| {
                        p.device_names().iter().any(|d| devices.contains(d))
                    })
                }
            };
            if let Some(new_index) = matched {
                if taken.insert(new_index) {
                    pairs.push((old_index, new_index));
                }
            }
        }
        pairs
    }

    async fn check_replacements(
        &self,
        cluster: &PoolCluster,
        old_pool: &PoolSpec,
        diff: &TopologyDiff,
        old_devices: &BTreeSet<&str>,
        in_flight: &HashSet<String>,
    ) -> Result<Vec<PlannedReplacement>> {
        let ns = cluster.ns();
        let mut planned = Vec::new();

        for (group, old, new) in diff.replacements() {
            if old_devices.contains(new) {
                return Err(Error::StructuralViolation(format!(
                    "block device {} is already part of the cluster",
                    new
                )));
            }

            let observed = &desired_groups(old_pool, group.kind)[group.observed_index];
            if let Some(busy) = observed
                .device_names()
                .into_iter()
                .find(|d| in_flight.contains(*d))
            {
                return Err(Error::ReplacementInProgress {
                    device: busy.to_string(),
                });
            }

            let incoming = self.stores.devices.get_block_device(&ns, new).await?;
            let outgoing = self.stores.devices.get_block_device(&ns, old).await?;
            check_capacity(&incoming, &outgoing)?;
            self.claims.is_usable(cluster, &incoming).await?;

            planned.push(PlannedReplacement {
                old: old.to_string(),
                new: new.to_string(),
            });
        }
        Ok(planned)
    }

    async fn check_expansion(&self, cluster: &PoolCluster, new_pool: &PoolSpec, diff: &TopologyDiff) -> Result<()> {
        let mut incoming: Vec<&str> = Vec::new();
        for added in &diff.new_groups {
            let group = &desired_groups(new_pool, added.kind)[added.desired_index];
            incoming.extend(group.block_devices.iter().map(|bd| bd.block_device_name.as_str()));
        }
        for (_, added) in diff.stripe_expansions() {
            incoming.extend(added.iter().map(String::as_str));
        }

        for name in incoming {
            if !self.claims.is_usable_by_name(cluster, name).await? {
                return Err(Error::StructuralViolation(format!(
                    "block device {} is not usable",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn check_raid_type(old: &PoolSpec, new: &PoolSpec) -> Result<()> {
    if old.pool_config.data_raid_group_type != new.pool_config.data_raid_group_type {
        return Err(Error::StructuralViolation(format!(
            "data raid group type cannot change from {} to {}",
            old.pool_config.data_raid_group_type, new.pool_config.data_raid_group_type
        )));
    }
    if !old.write_cache_raid_groups.is_empty()
        && old.pool_config.write_cache_group_type != new.pool_config.write_cache_group_type
    {
        return Err(Error::StructuralViolation(
            "write-cache raid group type cannot change".into(),
        ));
    }
    Ok(())
}

fn check_no_shrink(diff: &TopologyDiff) -> Result<()> {
    match diff.first_violation() {
        Some(reason) => Err(Error::StructuralViolation(reason.to_string())),
        None => Ok(()),
    }
}

fn check_capacity(incoming: &BlockDevice, outgoing: &BlockDevice) -> Result<()> {
    let new_bytes = incoming.capacity_bytes()?;
    let old_bytes = outgoing.capacity_bytes()?;
    if new_bytes < old_bytes {
        return Err(Error::CapacityTooSmall {
            new_device: incoming.name_any(),
            new_bytes,
            old_device: outgoing.name_any(),
            old_bytes,
        });
    }
    Ok(())
}
