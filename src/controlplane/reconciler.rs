//! PoolCluster reconciler
//!
//! Drives one cluster through `NoFinalizer -> Active -> Deleting -> Gone`.
//! Every pass starts from a fresh read of the stores, so a pass that failed
//! half way is repaired by the next one. Errors that concern a single pool
//! are logged and published as events; the pass moves on to the next pool.

use kube::ResourceExt;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::status::StatusAggregator;
use crate::crd::{BlockDeviceRef, PoolCluster, PoolInstance, PoolSpec, CLUSTER_FINALIZER};
use crate::domain::ports::{ObjectEvent, Stores};
use crate::error::{Error, Result};
use crate::retry::{with_retry, RetryPolicy};
use crate::topology::differ::{desired_groups, groups_mut, replace_device};
use crate::topology::{
    build_instance, build_manager, diff_pool, effective_config, sync_config, ClaimEngine, GroupDiff,
    InstanceParams, ManagerTemplate, NodeResolver, NodeSelection, TopologyDiff,
};

const CLUSTER_KIND: &str = "PoolCluster";
const INSTANCE_KIND: &str = "PoolInstance";

/// Requeue delay while waiting for instances to be destroyed
const DELETION_POLL: Duration = Duration::from_secs(5);

// =============================================================================
// Configuration
// =============================================================================

/// Reconciler settings
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Periodic resync of every cluster
    pub resync_interval: Duration,
    /// Retry policy for status writes and claims
    pub retry: RetryPolicy,
    /// Runtime manager settings
    pub manager: ManagerTemplate,
    /// Version recorded as current on first sync
    pub operator_version: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            manager: ManagerTemplate::default(),
            operator_version: crate::VERSION.to_string(),
        }
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Where a cluster is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NoFinalizer,
    Active,
    Deleting,
    /// Deletion requested and nothing left to clean up
    Gone,
}

impl LifecycleState {
    pub fn of(cluster: &PoolCluster) -> Self {
        match (cluster.has_finalizer(), cluster.is_deleting()) {
            (false, false) => LifecycleState::NoFinalizer,
            (true, false) => LifecycleState::Active,
            (true, true) => LifecycleState::Deleting,
            (false, true) => LifecycleState::Gone,
        }
    }
}

/// Counters for one active pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub created: usize,
    pub deleted: usize,
    pub managers_created: usize,
    pub managers_removed: usize,
    pub instances_updated: usize,
    pub replacements_completed: usize,
    pub pool_errors: usize,
}

/// Result of one reconcile call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    NotFound,
    Disabled,
    /// Topology changes paused until the upgrade finishes
    Upgrading,
    Reconciled(PassSummary),
    Deleting { remaining: usize },
    Finalized { claims_released: usize },
}

impl ReconcileOutcome {
    /// Delay before the cluster should be looked at again
    pub fn requeue_after(&self, resync: Duration) -> Option<Duration> {
        match self {
            ReconcileOutcome::NotFound | ReconcileOutcome::Finalized { .. } => None,
            ReconcileOutcome::Deleting { .. } => Some(DELETION_POLL),
            _ => Some(resync),
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Per-cluster control loop
pub struct Reconciler {
    stores: Stores,
    resolver: NodeResolver,
    claims: ClaimEngine,
    status: StatusAggregator,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(stores: Stores, config: ReconcilerConfig) -> Arc<Self> {
        Arc::new(Self {
            resolver: NodeResolver::new(stores.nodes.clone()),
            claims: ClaimEngine::new(stores.devices.clone(), config.retry),
            status: StatusAggregator::new(config.operator_version.clone()),
            stores,
            config,
        })
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Run one pass for the named cluster
    #[instrument(skip_all, fields(namespace = %namespace, cluster = %name))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let Some(cluster) = self.stores.clusters.get_cluster(namespace, name).await? else {
            debug!("cluster no longer exists");
            return Ok(ReconcileOutcome::NotFound);
        };

        if cluster.is_reconcile_disabled() {
            warn!("reconciliation disabled by annotation, skipping");
            self.publish(ObjectEvent::warning(
                CLUSTER_KIND,
                name,
                namespace,
                "ReconcileDisabled",
                "reconciliation is disabled by annotation",
            ))
            .await;
            return Ok(ReconcileOutcome::Disabled);
        }

        match LifecycleState::of(&cluster) {
            LifecycleState::NoFinalizer => {
                let cluster = self.add_finalizer(cluster).await?;
                self.reconcile_active(&cluster).await
            }
            LifecycleState::Active => self.reconcile_active(&cluster).await,
            LifecycleState::Deleting => self.reconcile_deleting(&cluster).await,
            LifecycleState::Gone => Ok(ReconcileOutcome::NotFound),
        }
    }

    async fn add_finalizer(&self, mut cluster: PoolCluster) -> Result<PoolCluster> {
        cluster.finalizers_mut().push(CLUSTER_FINALIZER.to_string());
        let updated = self.stores.clusters.update_cluster(&cluster).await?;
        info!("cluster finalizer added");
        Ok(updated)
    }

    // =========================================================================
    // Active
    // =========================================================================

    async fn reconcile_active(&self, cluster: &PoolCluster) -> Result<ReconcileOutcome> {
        let ns = cluster.ns();
        let name = cluster.name_any();

        if cluster.upgrade_in_progress() {
            info!(
                desired = ?cluster.spec.version_details.desired,
                current = ?cluster.current_version(),
                "upgrade in progress, topology changes paused"
            );
            self.update_status(&ns, &name).await;
            return Ok(ReconcileOutcome::Upgrading);
        }

        let mut summary = PassSummary::default();
        let live: Vec<PoolInstance> = self
            .stores
            .instances
            .list_instances(&ns, &name)
            .await?
            .into_iter()
            .filter(|pi| !pi.is_deleting())
            .collect();

        let observed_hosts: BTreeSet<String> = live.iter().map(|pi| pi.spec.host_name.clone()).collect();
        let selection = self.resolver.select(&cluster.spec.pools, &observed_hosts).await;
        for (index, err) in &selection.failures {
            summary.pool_errors += 1;
            self.pool_warning(cluster, *index, "NodeResolutionFailed", err).await;
        }

        let desired = cluster.spec.pools.len();
        match live.len().cmp(&desired) {
            Ordering::Less => {
                self.scale_up(cluster, &selection, desired - live.len(), &mut summary)
                    .await
            }
            Ordering::Greater => {
                self.scale_down(cluster, &live, &selection, live.len() - desired, &mut summary)
                    .await
            }
            Ordering::Equal => {
                self.repair_managers(cluster, &live, &mut summary).await?;
                self.day_two(cluster, &live, &selection, &mut summary).await;
            }
        }
        self.collect_managers(cluster, &mut summary).await?;

        self.update_status(&ns, &name).await;
        debug!(?summary, "active pass finished");
        Ok(ReconcileOutcome::Reconciled(summary))
    }

    async fn scale_up(
        &self,
        cluster: &PoolCluster,
        selection: &NodeSelection,
        count: usize,
        summary: &mut PassSummary,
    ) {
        for pending in selection.pending.iter().take(count) {
            let Some(pool) = cluster.spec.pools.get(pending.index) else {
                continue;
            };
            match self.provision(cluster, pool, &pending.node_name).await {
                Ok(instance) => {
                    summary.created += 1;
                    info!(instance = %instance, node = %pending.node_name, "pool instance created");
                    self.publish(ObjectEvent::normal(
                        CLUSTER_KIND,
                        &cluster.name_any(),
                        &cluster.ns(),
                        "ScaledUp",
                        format!("created pool instance {} on node {}", instance, pending.node_name),
                    ))
                    .await;
                }
                Err(e) => {
                    summary.pool_errors += 1;
                    self.pool_warning(cluster, pending.index, "ScaleUpFailed", &e).await;
                }
            }
        }
    }

    /// Claim the pool's devices, then create the instance and its manager
    async fn provision(&self, cluster: &PoolCluster, pool: &PoolSpec, node_name: &str) -> Result<String> {
        let devices = pool.device_names();
        for device in &devices {
            if !self.claims.is_usable_by_name(cluster, device).await? {
                return Err(Error::StructuralViolation(format!(
                    "block device {} is not usable",
                    device
                )));
            }
        }
        for device in &devices {
            self.claims.claim_device(cluster, device).await?;
        }

        let instance = build_instance(InstanceParams {
            cluster,
            pool,
            node_name,
        });
        let name = instance.name_any();
        let instance = match self.stores.instances.create_instance(&instance).await {
            Ok(created) => created,
            Err(Error::ResourceExists { .. }) => {
                debug!(instance = %name, "instance already exists");
                instance
            }
            Err(e) => return Err(e),
        };
        self.ensure_manager(&instance).await?;
        Ok(name)
    }

    async fn scale_down(
        &self,
        cluster: &PoolCluster,
        live: &[PoolInstance],
        selection: &NodeSelection,
        count: usize,
        summary: &mut PassSummary,
    ) {
        if !selection.failures.is_empty() {
            warn!(
                unresolved = selection.failures.len(),
                "pool nodes unresolved, not scaling down"
            );
            return;
        }
        let desired_nodes = selection.desired_nodes();
        let orphans = live
            .iter()
            .filter(|pi| !desired_nodes.contains(pi.host_name()))
            .take(count);

        for instance in orphans {
            let name = instance.name_any();
            match self.stores.instances.delete_instance(&cluster.ns(), &name).await {
                Ok(()) | Err(Error::ResourceNotFound { .. }) => {
                    summary.deleted += 1;
                    info!(instance = %name, node = %instance.host_name(), "orphaned pool instance deleted");
                    self.publish(ObjectEvent::normal(
                        CLUSTER_KIND,
                        &cluster.name_any(),
                        &cluster.ns(),
                        "ScaledDown",
                        format!("deleted pool instance {} on node {}", name, instance.host_name()),
                    ))
                    .await;
                }
                Err(e) => {
                    summary.pool_errors += 1;
                    warn!(instance = %name, error = %e, "failed to delete orphaned instance");
                }
            }
        }
    }

    // =========================================================================
    // Runtime managers
    // =========================================================================

    async fn ensure_manager(&self, instance: &PoolInstance) -> Result<bool> {
        let manager = build_manager(instance, &self.config.manager);
        match self.stores.managers.create_manager(&manager).await {
            Ok(()) => Ok(true),
            Err(Error::ResourceExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Instances that lost their manager get a new one
    async fn repair_managers(
        &self,
        cluster: &PoolCluster,
        live: &[PoolInstance],
        summary: &mut PassSummary,
    ) -> Result<()> {
        let existing: HashSet<String> = self
            .stores
            .managers
            .list_managers(&cluster.ns(), &cluster.name_any())
            .await?
            .into_iter()
            .map(|m| m.name)
            .collect();

        for instance in live.iter().filter(|pi| !existing.contains(&pi.name_any())) {
            if self.ensure_manager(instance).await? {
                summary.managers_created += 1;
                info!(instance = %instance.name_any(), "runtime manager recreated");
            }
        }
        Ok(())
    }

    /// Managers whose instance is gone are removed
    async fn collect_managers(&self, cluster: &PoolCluster, summary: &mut PassSummary) -> Result<()> {
        let ns = cluster.ns();
        let name = cluster.name_any();
        let instances: HashSet<String> = self
            .stores
            .instances
            .list_instances(&ns, &name)
            .await?
            .iter()
            .map(|pi| pi.name_any())
            .collect();

        for manager in self.stores.managers.list_managers(&ns, &name).await? {
            if instances.contains(&manager.name) {
                continue;
            }
            match self.stores.managers.delete_manager(&ns, &manager.name).await {
                Ok(()) => {
                    summary.managers_removed += 1;
                    info!(manager = %manager.name, "runtime manager without instance removed");
                }
                Err(Error::ResourceNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Day-2 operations
    // =========================================================================

    async fn day_two(
        &self,
        cluster: &PoolCluster,
        live: &[PoolInstance],
        selection: &NodeSelection,
        summary: &mut PassSummary,
    ) {
        let mut replaced = HashSet::new();
        for (index, node) in &selection.resolved {
            let Some(pool) = cluster.spec.pools.get(*index) else {
                continue;
            };
            let Some(instance) = live.iter().find(|pi| pi.host_name() == node) else {
                continue;
            };
            match self.converge_pool(cluster, pool, instance.clone(), &mut replaced).await {
                Ok(true) => summary.instances_updated += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.pool_errors += 1;
                    self.pool_warning(cluster, *index, "PoolUpdateFailed", &e).await;
                }
            }
        }

        match self.complete_replacements(cluster, &replaced).await {
            Ok(done) => summary.replacements_completed = done,
            Err(e) => {
                summary.pool_errors += 1;
                warn!(error = %e, "failed to complete device replacements");
            }
        }
    }

    /// Sync config, then apply replacements and expansions, in that order.
    /// Returns whether the instance was written.
    async fn converge_pool(
        &self,
        cluster: &PoolCluster,
        pool: &PoolSpec,
        mut instance: PoolInstance,
        replaced: &mut HashSet<String>,
    ) -> Result<bool> {
        let name = instance.name_any();
        let mut changed = sync_config(&effective_config(cluster, pool), &mut instance.spec.pool_config);
        if instance.spec.node_selector != pool.node_selector {
            instance.spec.node_selector = pool.node_selector.clone();
            changed = true;
        }

        let diff = diff_pool(pool, &instance.spec);
        if let Some(violation) = diff.first_violation() {
            warn!(instance = %name, %violation, "topology change cannot be applied");
            self.publish(ObjectEvent::warning(
                INSTANCE_KIND,
                &name,
                &cluster.ns(),
                "TopologyChangeRejected",
                violation.to_string(),
            ))
            .await;
        } else if !diff.is_noop() {
            changed |= self.apply_replacements(cluster, &mut instance, &diff, replaced).await;
            changed |= self.apply_expansions(cluster, pool, &mut instance, &diff).await;
        }

        if changed {
            self.stores.instances.update_instance(&instance).await?;
            debug!(instance = %name, "pool instance updated");
        }
        Ok(changed)
    }

    async fn apply_replacements(
        &self,
        cluster: &PoolCluster,
        instance: &mut PoolInstance,
        diff: &TopologyDiff,
        replaced: &mut HashSet<String>,
    ) -> bool {
        let mut changed = false;
        for (group, old, new) in diff.replacements() {
            match self.replace(cluster, instance, group, old, new).await {
                Ok(true) => {
                    changed = true;
                    replaced.insert(new.to_string());
                    info!(instance = %instance.name_any(), old = %old, new = %new, "block device replaced");
                    self.publish(ObjectEvent::normal(
                        INSTANCE_KIND,
                        &instance.name_any(),
                        &cluster.ns(),
                        "DeviceReplaced",
                        format!("replacing block device {} with {}", old, new),
                    ))
                    .await;
                }
                Ok(false) => debug!(new = %new, "replacement device not usable yet"),
                Err(e) => self.instance_warning(cluster, instance, "ReplacementFailed", &e).await,
            }
        }
        changed
    }

    async fn replace(
        &self,
        cluster: &PoolCluster,
        instance: &mut PoolInstance,
        group: &GroupDiff,
        old: &str,
        new: &str,
    ) -> Result<bool> {
        if !self.claims.is_usable_by_name(cluster, new).await? {
            return Ok(false);
        }
        self.claims.claim_replacement(cluster, new, old).await?;
        Ok(groups_mut(&mut instance.spec, group.kind)
            .get_mut(group.observed_index)
            .map(|g| replace_device(g, old, new))
            .unwrap_or(false))
    }

    async fn apply_expansions(
        &self,
        cluster: &PoolCluster,
        pool: &PoolSpec,
        instance: &mut PoolInstance,
        diff: &TopologyDiff,
    ) -> bool {
        let mut changed = false;

        for new_group in &diff.new_groups {
            let Some(group) = desired_groups(pool, new_group.kind).get(new_group.desired_index) else {
                continue;
            };
            match self.claim_all(cluster, group.block_devices.iter().map(|bd| bd.block_device_name.as_str())).await {
                Ok(true) => {
                    groups_mut(&mut instance.spec, new_group.kind).push(group.clone());
                    changed = true;
                    self.publish(ObjectEvent::normal(
                        INSTANCE_KIND,
                        &instance.name_any(),
                        &cluster.ns(),
                        "PoolExpanded",
                        format!("added {} raid group with {} devices", new_group.kind, group.len()),
                    ))
                    .await;
                }
                Ok(false) => debug!(kind = %new_group.kind, "new raid group has unusable devices"),
                Err(e) => self.instance_warning(cluster, instance, "ExpansionFailed", &e).await,
            }
        }

        for (group, added) in diff.stripe_expansions() {
            for device in added {
                match self.claim_all(cluster, std::iter::once(device.as_str())).await {
                    Ok(true) => {
                        if let Some(observed) = groups_mut(&mut instance.spec, group.kind).get_mut(group.observed_index) {
                            observed.block_devices.push(BlockDeviceRef::new(device.clone()));
                            changed = true;
                            self.publish(ObjectEvent::normal(
                                INSTANCE_KIND,
                                &instance.name_any(),
                                &cluster.ns(),
                                "PoolExpanded",
                                format!("added block device {} to stripe group", device),
                            ))
                            .await;
                        }
                    }
                    Ok(false) => debug!(device = %device, "expansion device not usable"),
                    Err(e) => self.instance_warning(cluster, instance, "ExpansionFailed", &e).await,
                }
            }
        }
        changed
    }

    /// Claim every device if all of them are usable
    async fn claim_all<'a>(
        &self,
        cluster: &PoolCluster,
        devices: impl Iterator<Item = &'a str> + Clone,
    ) -> Result<bool> {
        for device in devices.clone() {
            if !self.claims.is_usable_by_name(cluster, device).await? {
                return Ok(false);
            }
        }
        for device in devices {
            self.claims.claim_device(cluster, device).await?;
        }
        Ok(true)
    }

    /// Clear the predecessor of claims whose replacement has settled
    async fn complete_replacements(
        &self,
        cluster: &PoolCluster,
        replaced_this_pass: &HashSet<String>,
    ) -> Result<usize> {
        let pending = self.claims.pending_replacements(cluster).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let instances = self
            .stores
            .instances
            .list_instances(&cluster.ns(), &cluster.name_any())
            .await?;

        let mut completed = 0;
        for claim in pending {
            let device = claim.spec.block_device_name.clone();
            let Some(old) = claim.predecessor().map(str::to_string) else {
                continue;
            };
            if replaced_this_pass.contains(&device) {
                continue;
            }
            let Some(instance) = instances
                .iter()
                .find(|pi| pi.device_names().contains(device.as_str()))
            else {
                continue;
            };
            if instance.device_names().contains(old.as_str())
                || instance.is_resilvering(&device)
                || !instance.is_online()
            {
                debug!(device = %device, predecessor = %old, "replacement still settling");
                continue;
            }

            self.claims.complete_replacement(cluster, claim).await?;
            completed += 1;
            self.publish(ObjectEvent::normal(
                INSTANCE_KIND,
                &instance.name_any(),
                &cluster.ns(),
                "ReplacementCompleted",
                format!("block device {} replaced {}", device, old),
            ))
            .await;
        }
        Ok(completed)
    }

    // =========================================================================
    // Deleting
    // =========================================================================

    async fn reconcile_deleting(&self, cluster: &PoolCluster) -> Result<ReconcileOutcome> {
        let ns = cluster.ns();
        let name = cluster.name_any();

        let instances = self.stores.instances.list_instances(&ns, &name).await?;
        for instance in instances.iter().filter(|pi| !pi.is_deleting()) {
            match self.stores.instances.delete_instance(&ns, &instance.name_any()).await {
                Ok(()) | Err(Error::ResourceNotFound { .. }) => {
                    info!(instance = %instance.name_any(), "pool instance deletion requested");
                }
                Err(e) => return Err(e),
            }
        }

        let remaining = self.stores.instances.list_instances(&ns, &name).await?.len();
        if remaining > 0 {
            info!(remaining, "waiting for pool instances to be removed");
            self.update_status(&ns, &name).await;
            return Ok(ReconcileOutcome::Deleting { remaining });
        }

        let mut summary = PassSummary::default();
        self.collect_managers(cluster, &mut summary).await?;
        let claims_released = self.claims.release_claims(cluster).await?;

        let Some(mut fresh) = self.stores.clusters.get_cluster(&ns, &name).await? else {
            return Ok(ReconcileOutcome::Finalized { claims_released });
        };
        fresh.finalizers_mut().retain(|f| f != CLUSTER_FINALIZER);
        self.stores.clusters.update_cluster(&fresh).await?;
        info!(claims_released, "cluster finalizer removed");
        Ok(ReconcileOutcome::Finalized { claims_released })
    }

    // =========================================================================
    // Status and events
    // =========================================================================

    /// Recompute and write status, re-reading the cluster on every attempt
    async fn update_status(&self, namespace: &str, name: &str) {
        let result = with_retry(&self.config.retry, "update cluster status", || {
            self.write_status(namespace, name)
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "status update dropped until next pass");
        }
    }

    async fn write_status(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(mut cluster) = self.stores.clusters.get_cluster(namespace, name).await? else {
            return Ok(());
        };
        let instances = self.stores.instances.list_instances(namespace, name).await?;
        let managers = self.stores.managers.list_managers(namespace, name).await?;
        cluster.status = Some(self.status.compute(&cluster, &instances, &managers));
        self.stores.clusters.update_cluster_status(&cluster).await?;
        Ok(())
    }

    async fn publish(&self, event: ObjectEvent) {
        self.stores.events.publish(event).await;
    }

    async fn pool_warning(&self, cluster: &PoolCluster, index: usize, reason: &str, err: &Error) {
        warn!(pool = index, error = %err, reason, "pool skipped");
        self.publish(ObjectEvent::warning(
            CLUSTER_KIND,
            &cluster.name_any(),
            &cluster.ns(),
            reason,
            format!("pool {}: {}", index, err),
        ))
        .await;
    }

    async fn instance_warning(&self, cluster: &PoolCluster, instance: &PoolInstance, reason: &str, err: &Error) {
        warn!(instance = %instance.name_any(), error = %err, reason, "day-2 step failed");
        self.publish(ObjectEvent::warning(
            INSTANCE_KIND,
            &instance.name_any(),
            &cluster.ns(),
            reason,
            err.to_string(),
        ))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::instance::{DetachedPoolEngine, InstanceController};
    use crate::crd::{
        BlockDevice, BlockDeviceSpec, BlockDeviceStatus, ClaimState, ClusterPhase, DeviceCapacity,
        DeviceState, InstancePhase, PoolConfig, PoolInstanceStatus, RaidGroup, RaidType,
        HOSTNAME_LABEL, RECONCILE_DISABLED_ANNOTATION,
    };
    use crate::domain::ports::{
        DeviceStore, PoolClusterStore, PoolInstanceStore, RuntimeManagerStore,
    };
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    const NS: &str = "openebs";

    fn device(name: &str, node: &str) -> BlockDevice {
        let mut bd = BlockDevice::new(
            name,
            BlockDeviceSpec {
                node_name: node.into(),
                path: format!("/dev/{}", name),
                capacity: DeviceCapacity {
                    storage: "10Gi".into(),
                },
                filesystem: None,
                claim_ref: None,
            },
        );
        bd.metadata.namespace = Some(NS.into());
        bd.status = Some(BlockDeviceStatus {
            claim_state: ClaimState::Unclaimed,
            state: DeviceState::Active,
        });
        bd
    }

    fn pool(node: &str, raid_type: RaidType, devices: &[&str]) -> PoolSpec {
        PoolSpec {
            node_selector: BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.to_string())]),
            pool_config: PoolConfig {
                data_raid_group_type: raid_type,
                ..Default::default()
            },
            data_raid_groups: vec![RaidGroup::new(devices.iter().copied())],
            write_cache_raid_groups: vec![],
        }
    }

    /// Three nodes with three devices each: `<node>-bd-<n>`
    fn setup(pools: Vec<PoolSpec>) -> (Arc<MemoryStore>, Arc<Reconciler>) {
        let store = MemoryStore::new();
        for node in ["worker-1", "worker-2", "worker-3"] {
            store.add_node(
                node,
                BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.to_string())]),
            );
            for n in 1..=3 {
                store.add_block_device(device(&format!("{}-bd-{}", node, n), node));
            }
        }
        let mut cluster = PoolCluster::with_pools("fleet", NS, pools);
        cluster.metadata.uid = Some("uid-fleet".into());
        store.add_cluster(cluster);

        let config = ReconcilerConfig {
            retry: RetryPolicy::immediate(3),
            ..Default::default()
        };
        let reconciler = Reconciler::new(Stores::from_shared(store.clone()), config);
        (store, reconciler)
    }

    async fn edit(store: &MemoryStore, f: impl FnOnce(&mut PoolCluster)) {
        let mut cluster = store.get_cluster(NS, "fleet").await.unwrap().unwrap();
        f(&mut cluster);
        store.replace_cluster_spec(&cluster).unwrap();
    }

    async fn live_instances(store: &MemoryStore) -> Vec<PoolInstance> {
        store
            .list_instances(NS, "fleet")
            .await
            .unwrap()
            .into_iter()
            .filter(|pi| !pi.is_deleting())
            .collect()
    }

    async fn set_online(store: &MemoryStore, resilvering: &[&str]) {
        for mut pi in store.list_instances(NS, "fleet").await.unwrap() {
            pi.status = Some(PoolInstanceStatus {
                phase: InstancePhase::Online,
                resilvering_devices: resilvering.iter().map(|d| d.to_string()).collect(),
                ..Default::default()
            });
            store.update_instance_status(&pi).await.unwrap();
        }
    }

    fn summary(outcome: ReconcileOutcome) -> PassSummary {
        match outcome {
            ReconcileOutcome::Reconciled(summary) => summary,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_lifecycle_state() {
        let mut cluster = PoolCluster::with_pools("fleet", NS, vec![]);
        assert_eq!(LifecycleState::of(&cluster), LifecycleState::NoFinalizer);
        cluster.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]);
        assert_eq!(LifecycleState::of(&cluster), LifecycleState::Active);
        cluster.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));
        assert_eq!(LifecycleState::of(&cluster), LifecycleState::Deleting);
        cluster.metadata.finalizers = None;
        assert_eq!(LifecycleState::of(&cluster), LifecycleState::Gone);
    }

    #[tokio::test]
    async fn test_first_pass_provisions_single_pool() {
        let (store, reconciler) = setup(vec![pool(
            "worker-1",
            RaidType::Mirror,
            &["worker-1-bd-1", "worker-1-bd-2"],
        )]);

        let summary = summary(reconciler.reconcile(NS, "fleet").await.unwrap());
        assert_eq!(summary.created, 1);
        assert_eq!(summary.pool_errors, 0);

        let cluster = store.get_cluster(NS, "fleet").await.unwrap().unwrap();
        assert!(cluster.has_finalizer());
        let status = cluster.status.unwrap();
        assert_eq!(status.provisioned_instances, 1);
        assert_eq!(status.desired_instances, 1);
        assert_eq!(status.healthy_instances, 0);
        assert_eq!(status.version_details.current.as_deref(), Some(crate::VERSION));

        let instances = live_instances(&store).await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].host_name(), "worker-1");
        assert!(instances[0].has_protection_finalizer());
        assert_eq!(store.manager_count(NS), 1);
        assert_eq!(store.claim_count(NS), 2);
        assert!(store.events().iter().any(|e| e.reason == "ScaledUp"));

        // A second pass changes nothing
        let summary = summary_of(&reconciler).await;
        assert_eq!(summary, PassSummary::default());
    }

    async fn summary_of(reconciler: &Reconciler) -> PassSummary {
        summary(reconciler.reconcile(NS, "fleet").await.unwrap())
    }

    #[tokio::test]
    async fn test_scale_converges_without_overshoot() {
        let (store, reconciler) = setup(vec![pool("worker-1", RaidType::Stripe, &["worker-1-bd-1"])]);
        assert_eq!(summary_of(&reconciler).await.created, 1);

        edit(&store, |c| {
            c.spec.pools.push(pool("worker-2", RaidType::Stripe, &["worker-2-bd-1"]));
            c.spec.pools.push(pool("worker-3", RaidType::Stripe, &["worker-3-bd-1"]));
        })
        .await;
        let up = summary_of(&reconciler).await;
        assert_eq!((up.created, up.deleted), (2, 0));
        assert_eq!(live_instances(&store).await.len(), 3);

        edit(&store, |c| c.spec.pools.truncate(1)).await;
        let down = summary_of(&reconciler).await;
        assert_eq!((down.created, down.deleted), (0, 2));
        let remaining = live_instances(&store).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].host_name(), "worker-1");
    }

    #[tokio::test]
    async fn test_unresolvable_pool_does_not_block_others() {
        let (store, reconciler) = setup(vec![
            pool("ghost", RaidType::Stripe, &["worker-1-bd-1"]),
            pool("worker-2", RaidType::Stripe, &["worker-2-bd-1"]),
        ]);

        let summary = summary_of(&reconciler).await;
        assert_eq!(summary.created, 1);
        assert_eq!(summary.pool_errors, 1);
        assert_eq!(live_instances(&store).await[0].host_name(), "worker-2");
        assert!(store.events().iter().any(|e| e.reason == "NodeResolutionFailed"));
    }

    #[tokio::test]
    async fn test_missing_manager_is_recreated() {
        let (store, reconciler) = setup(vec![pool("worker-1", RaidType::Stripe, &["worker-1-bd-1"])]);
        summary_of(&reconciler).await;
        let name = live_instances(&store).await[0].name_any();

        store.delete_manager(NS, &name).await.unwrap();
        assert_eq!(store.manager_count(NS), 0);

        assert_eq!(summary_of(&reconciler).await.managers_created, 1);
        assert_eq!(store.manager_count(NS), 1);
    }

    #[tokio::test]
    async fn test_healthy_instances_reported() {
        let (store, reconciler) = setup(vec![pool("worker-1", RaidType::Stripe, &["worker-1-bd-1"])]);
        summary_of(&reconciler).await;
        let name = live_instances(&store).await[0].name_any();

        store.set_manager_ready(NS, &name, 1);
        set_online(&store, &[]).await;
        summary_of(&reconciler).await;

        let status = store.get_cluster(NS, "fleet").await.unwrap().unwrap().status.unwrap();
        assert_eq!(status.healthy_instances, 1);
        assert_eq!(status.phase, ClusterPhase::Online);
        assert!(status.conditions.iter().all(|c| c.is_true()));
    }

    #[tokio::test]
    async fn test_replacement_applied_then_completed() {
        let (store, reconciler) = setup(vec![pool(
            "worker-1",
            RaidType::Mirror,
            &["worker-1-bd-1", "worker-1-bd-2"],
        )]);
        summary_of(&reconciler).await;

        edit(&store, |c| {
            c.spec.pools[0].data_raid_groups = vec![RaidGroup::new(["worker-1-bd-1", "worker-1-bd-3"])];
        })
        .await;
        let pass = summary_of(&reconciler).await;
        assert_eq!(pass.instances_updated, 1);
        assert_eq!(pass.replacements_completed, 0);

        let instance = &live_instances(&store).await[0];
        assert!(instance.device_names().contains("worker-1-bd-3"));
        assert!(!instance.device_names().contains("worker-1-bd-2"));
        let claims = store.list_claims(NS, "fleet").await.unwrap();
        let pending: Vec<_> = claims.iter().filter_map(|c| c.predecessor()).collect();
        assert_eq!(pending, vec!["worker-1-bd-2"]);

        // Still resilvering
        set_online(&store, &["worker-1-bd-3"]).await;
        assert_eq!(summary_of(&reconciler).await.replacements_completed, 0);

        set_online(&store, &[]).await;
        assert_eq!(summary_of(&reconciler).await.replacements_completed, 1);
        assert_eq!(store.claim_count(NS), 2);
        let old = store.get_block_device(NS, "worker-1-bd-2").await.unwrap();
        assert_eq!(old.claim_state(), ClaimState::Unclaimed);
    }

    #[tokio::test]
    async fn test_stripe_expansion_and_config_sync() {
        let (store, reconciler) = setup(vec![pool("worker-1", RaidType::Stripe, &["worker-1-bd-1"])]);
        summary_of(&reconciler).await;

        edit(&store, |c| {
            let p = &mut c.spec.pools[0];
            p.data_raid_groups[0] = RaidGroup::new(["worker-1-bd-1", "worker-1-bd-2"]);
            p.data_raid_groups.push(RaidGroup::new(["worker-1-bd-3"]));
            p.pool_config.priority_class_name = Some("pool-critical".into());
        })
        .await;
        assert_eq!(summary_of(&reconciler).await.instances_updated, 1);

        let instance = &live_instances(&store).await[0];
        assert_eq!(instance.spec.data_raid_groups.len(), 2);
        assert_eq!(instance.spec.data_raid_groups[0].len(), 2);
        assert_eq!(
            instance.spec.pool_config.priority_class_name.as_deref(),
            Some("pool-critical")
        );
        assert_eq!(store.claim_count(NS), 3);
    }

    #[tokio::test]
    async fn test_new_group_with_inactive_device_not_applied() {
        let (store, reconciler) = setup(vec![pool(
            "worker-1",
            RaidType::Mirror,
            &["worker-1-bd-1", "worker-1-bd-2"],
        )]);
        summary_of(&reconciler).await;
        assert_eq!(store.claim_count(NS), 2);

        let mut offline = device("worker-1-bd-4", "worker-1");
        offline.status = Some(BlockDeviceStatus {
            claim_state: ClaimState::Unclaimed,
            state: DeviceState::Inactive,
        });
        store.add_block_device(offline);
        edit(&store, |c| {
            c.spec.pools[0]
                .data_raid_groups
                .push(RaidGroup::new(["worker-1-bd-3", "worker-1-bd-4"]));
        })
        .await;
        assert_eq!(summary_of(&reconciler).await.instances_updated, 0);

        let instance = &live_instances(&store).await[0];
        assert_eq!(instance.spec.data_raid_groups.len(), 1);
        assert_eq!(store.claim_count(NS), 2);
        assert!(!store.events().iter().any(|e| e.reason == "PoolExpanded"));
    }

    #[tokio::test]
    async fn test_disabled_cluster_is_skipped() {
        let (store, reconciler) = setup(vec![pool("worker-1", RaidType::Stripe, &["worker-1-bd-1"])]);
        edit(&store, |c| {
            c.metadata.annotations = Some(BTreeMap::from([(
                RECONCILE_DISABLED_ANNOTATION.to_string(),
                "true".to_string(),
            )]));
        })
        .await;

        assert_eq!(reconciler.reconcile(NS, "fleet").await.unwrap(), ReconcileOutcome::Disabled);
        assert!(live_instances(&store).await.is_empty());
        assert!(store
            .events()
            .iter()
            .any(|e| e.reason == "ReconcileDisabled"));
    }

    #[tokio::test]
    async fn test_upgrade_pauses_topology_changes() {
        let (store, reconciler) = setup(vec![pool("worker-1", RaidType::Stripe, &["worker-1-bd-1"])]);
        summary_of(&reconciler).await;

        edit(&store, |c| {
            c.spec.version_details.desired = Some("99.0.0".into());
            c.spec.pools.push(pool("worker-2", RaidType::Stripe, &["worker-2-bd-1"]));
        })
        .await;
        assert_eq!(reconciler.reconcile(NS, "fleet").await.unwrap(), ReconcileOutcome::Upgrading);
        assert_eq!(live_instances(&store).await.len(), 1);
        let status = store.get_cluster(NS, "fleet").await.unwrap().unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Upgrading);
    }

    #[tokio::test]
    async fn test_status_write_retried() {
        let (store, reconciler) = setup(vec![pool("worker-1", RaidType::Stripe, &["worker-1-bd-1"])]);
        store.inject_failures("update_cluster_status", 2);
        summary_of(&reconciler).await;
        let cluster = store.get_cluster(NS, "fleet").await.unwrap().unwrap();
        assert_eq!(cluster.status.unwrap().provisioned_instances, 1);
    }

    #[tokio::test]
    async fn test_finalizer_removed_only_after_instances_gone() {
        let (store, reconciler) = setup(vec![
            pool("worker-1", RaidType::Stripe, &["worker-1-bd-1"]),
            pool("worker-2", RaidType::Stripe, &["worker-2-bd-1"]),
        ]);
        summary_of(&reconciler).await;
        store.delete_cluster(NS, "fleet").unwrap();

        assert_matches!(
            reconciler.reconcile(NS, "fleet").await.unwrap(),
            ReconcileOutcome::Deleting { remaining: 2 }
        );
        let cluster = store.get_cluster(NS, "fleet").await.unwrap().unwrap();
        assert!(cluster.has_finalizer());
        assert_eq!(store.claim_count(NS), 2);

        let instances = InstanceController::new(
            store.clone(),
            store.clone(),
            Arc::new(DetachedPoolEngine),
            Some("worker-1".into()),
        );
        assert_eq!(instances.sweep(NS).await.unwrap(), 1);
        assert_matches!(
            reconciler.reconcile(NS, "fleet").await.unwrap(),
            ReconcileOutcome::Deleting { remaining: 1 }
        );
        assert!(store.get_cluster(NS, "fleet").await.unwrap().is_some());

        let instances = InstanceController::new(
            store.clone(),
            store.clone(),
            Arc::new(DetachedPoolEngine),
            Some("worker-2".into()),
        );
        assert_eq!(instances.sweep(NS).await.unwrap(), 1);
        assert_eq!(
            reconciler.reconcile(NS, "fleet").await.unwrap(),
            ReconcileOutcome::Finalized { claims_released: 2 }
        );
        assert!(store.get_cluster(NS, "fleet").await.unwrap().is_none());
        assert_eq!(store.claim_count(NS), 0);
        assert_eq!(store.manager_count(NS), 0);
    }
}
