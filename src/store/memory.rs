//! In-memory store
//!
//! Implements every port over `parking_lot` guarded maps with the same
//! semantics the Kubernetes API gives the operator: create-if-absent,
//! optimistic concurrency on resource versions, and finalizer-delayed
//! deletion. Used by standalone mode and as the test double.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::crd::{
    BlockDevice, BlockDeviceClaim, BlockDeviceStatus, ClaimReference, ClaimState, PoolCluster,
    PoolInstance, CLUSTER_NAME_LABEL,
};
use crate::domain::ports::{
    DeviceStore, EventRecorder, NodeDirectory, ObjectEvent, PoolClusterStore, PoolInstanceStore,
    ReplicaDirectory, RuntimeManager, RuntimeManagerStore,
};
use crate::error::{Error, Result};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct Inner {
    clusters: BTreeMap<Key, PoolCluster>,
    instances: BTreeMap<Key, PoolInstance>,
    devices: BTreeMap<Key, BlockDevice>,
    claims: BTreeMap<Key, BlockDeviceClaim>,
    nodes: BTreeMap<String, BTreeMap<String, String>>,
    managers: BTreeMap<Key, RuntimeManager>,
    /// replica key -> instance name
    replicas: BTreeMap<Key, String>,
    events: Vec<ObjectEvent>,
}

/// Outcome of a delete request against a finalized object
enum Removal {
    Removed,
    Marked,
}

// =============================================================================
// Memory Store
// =============================================================================

/// Thread-safe in-memory implementation of every store port
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    version: AtomicU64,
    /// Operation name -> number of upcoming calls that fail transiently
    failures: Mutex<HashMap<&'static str, u32>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Stamp identity fields the API server would assign on creation
    fn stamp_new(&self, meta: &mut ObjectMeta) {
        let seq = self.version.load(Ordering::SeqCst);
        if meta.uid.is_none() {
            meta.uid = Some(format!("{:08x}-0000-4000-8000-{:012x}", seq, seq));
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(Utc::now()));
        }
        meta.resource_version = Some(self.next_version());
    }

    /// Reject writes carrying a stale resource version
    fn check_version(stored: &ObjectMeta, incoming: &ObjectMeta, kind: &str) -> Result<()> {
        match (&stored.resource_version, &incoming.resource_version) {
            (Some(s), Some(i)) if s != i => Err(Error::TransientStore(format!(
                "{}/{}: the object has been modified",
                kind,
                incoming.name.as_deref().unwrap_or_default()
            ))),
            _ => Ok(()),
        }
    }

    /// Consume one injected failure for `op`, if any
    fn maybe_fail(&self, op: &'static str) -> Result<()> {
        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::TransientStore(format!("injected failure for {}", op)));
            }
        }
        Ok(())
    }

    /// Make the next `count` calls of `op` fail with a transient error
    pub fn inject_failures(&self, op: &'static str, count: u32) {
        self.failures.lock().insert(op, count);
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    pub fn add_node(&self, name: &str, labels: BTreeMap<String, String>) {
        self.inner.write().nodes.insert(name.to_string(), labels);
    }

    pub fn add_block_device(&self, mut device: BlockDevice) {
        self.stamp_new(&mut device.metadata);
        let ns = device.namespace().unwrap_or_default();
        self.inner
            .write()
            .devices
            .insert(key(&ns, &device.name_any()), device);
    }

    pub fn add_cluster(&self, mut cluster: PoolCluster) {
        self.stamp_new(&mut cluster.metadata);
        self.inner
            .write()
            .clusters
            .insert(key(&cluster.ns(), &cluster.name_any()), cluster);
    }

    pub fn add_replica(&self, namespace: &str, name: &str, instance: &str) {
        self.inner
            .write()
            .replicas
            .insert(key(namespace, name), instance.to_string());
    }

    /// Replace a cluster spec as a user edit would
    pub fn replace_cluster_spec(&self, cluster: &PoolCluster) -> Result<()> {
        let mut inner = self.inner.write();
        let k = key(&cluster.ns(), &cluster.name_any());
        let stored = inner
            .clusters
            .get_mut(&k)
            .ok_or_else(|| Error::not_found("PoolCluster", cluster.name_any()))?;
        stored.spec = cluster.spec.clone();
        stored.metadata.annotations = cluster.metadata.annotations.clone();
        stored.metadata.resource_version = Some(self.next_version());
        Ok(())
    }

    /// Request deletion of a cluster as a user would
    pub fn delete_cluster(&self, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let k = key(namespace, name);
        let removal = match inner.clusters.get_mut(&k) {
            Some(cluster) => self.mark_or_remove(&mut cluster.metadata),
            None => return Err(Error::not_found("PoolCluster", name)),
        };
        if let Removal::Removed = removal {
            inner.clusters.remove(&k);
        }
        Ok(())
    }

    /// Update the ready replica count the runtime manager reports
    pub fn set_manager_ready(&self, namespace: &str, name: &str, ready_replicas: i32) {
        if let Some(manager) = self.inner.write().managers.get_mut(&key(namespace, name)) {
            manager.ready_replicas = ready_replicas;
        }
    }

    /// Update a device status as the disk directory would
    pub fn set_device_status(&self, namespace: &str, name: &str, status: BlockDeviceStatus) {
        if let Some(device) = self.inner.write().devices.get_mut(&key(namespace, name)) {
            device.status = Some(status);
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn events(&self) -> Vec<ObjectEvent> {
        self.inner.read().events.clone()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn cluster_count(&self) -> usize {
        self.inner.read().clusters.len()
    }

    pub fn device_count(&self) -> usize {
        self.inner.read().devices.len()
    }

    pub fn claim_count(&self, namespace: &str) -> usize {
        self.inner
            .read()
            .claims
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .count()
    }

    pub fn manager_count(&self, namespace: &str) -> usize {
        self.inner
            .read()
            .managers
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .count()
    }

    fn mark_or_remove(&self, meta: &mut ObjectMeta) -> Removal {
        let finalized = meta
            .finalizers
            .as_ref()
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if finalized {
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(Time(Utc::now()));
                meta.resource_version = Some(self.next_version());
            }
            Removal::Marked
        } else {
            Removal::Removed
        }
    }

    fn finalizers_cleared(meta: &ObjectMeta) -> bool {
        meta.deletion_timestamp.is_some()
            && meta.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true)
    }

    fn unbind_device(inner: &mut Inner, namespace: &str, device: &str) {
        if let Some(bd) = inner.devices.get_mut(&key(namespace, device)) {
            bd.spec.claim_ref = None;
            let status = bd.status.get_or_insert_with(BlockDeviceStatus::default);
            status.claim_state = ClaimState::Unclaimed;
        }
    }
}

fn has_cluster_label(labels: &BTreeMap<String, String>, cluster: &str) -> bool {
    labels.get(CLUSTER_NAME_LABEL).map(String::as_str) == Some(cluster)
}

// =============================================================================
// PoolClusterStore
// =============================================================================

#[async_trait]
impl PoolClusterStore for MemoryStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<PoolCluster>> {
        Ok(self.inner.read().clusters.get(&key(namespace, name)).cloned())
    }

    async fn list_clusters(&self, namespace: Option<&str>) -> Result<Vec<PoolCluster>> {
        Ok(self
            .inner
            .read()
            .clusters
            .iter()
            .filter(|((ns, _), _)| namespace.map(|n| n == ns).unwrap_or(true))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn update_cluster(&self, cluster: &PoolCluster) -> Result<PoolCluster> {
        self.maybe_fail("update_cluster")?;
        let mut inner = self.inner.write();
        let k = key(&cluster.ns(), &cluster.name_any());
        let stored = inner
            .clusters
            .get_mut(&k)
            .ok_or_else(|| Error::not_found("PoolCluster", cluster.name_any()))?;
        Self::check_version(&stored.metadata, &cluster.metadata, "PoolCluster")?;

        stored.spec = cluster.spec.clone();
        stored.metadata.finalizers = cluster.metadata.finalizers.clone();
        stored.metadata.annotations = cluster.metadata.annotations.clone();
        stored.metadata.labels = cluster.metadata.labels.clone();
        stored.metadata.resource_version = Some(self.next_version());
        let updated = stored.clone();

        if Self::finalizers_cleared(&updated.metadata) {
            info!(cluster = %updated.name_any(), "last finalizer removed, cluster gone");
            inner.clusters.remove(&k);
        }
        Ok(updated)
    }

    async fn update_cluster_status(&self, cluster: &PoolCluster) -> Result<PoolCluster> {
        self.maybe_fail("update_cluster_status")?;
        let mut inner = self.inner.write();
        let stored = inner
            .clusters
            .get_mut(&key(&cluster.ns(), &cluster.name_any()))
            .ok_or_else(|| Error::not_found("PoolCluster", cluster.name_any()))?;
        Self::check_version(&stored.metadata, &cluster.metadata, "PoolCluster")?;
        stored.status = cluster.status.clone();
        stored.metadata.resource_version = Some(self.next_version());
        Ok(stored.clone())
    }
}

// =============================================================================
// PoolInstanceStore
// =============================================================================

#[async_trait]
impl PoolInstanceStore for MemoryStore {
    async fn list_instances(&self, namespace: &str, cluster: &str) -> Result<Vec<PoolInstance>> {
        self.maybe_fail("list_instances")?;
        Ok(self
            .inner
            .read()
            .instances
            .iter()
            .filter(|((ns, _), pi)| ns == namespace && has_cluster_label(pi.labels(), cluster))
            .map(|(_, pi)| pi.clone())
            .collect())
    }

    async fn list_all_instances(&self, namespace: &str) -> Result<Vec<PoolInstance>> {
        Ok(self
            .inner
            .read()
            .instances
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pi)| pi.clone())
            .collect())
    }

    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<PoolInstance>> {
        Ok(self.inner.read().instances.get(&key(namespace, name)).cloned())
    }

    async fn create_instance(&self, instance: &PoolInstance) -> Result<PoolInstance> {
        self.maybe_fail("create_instance")?;
        let ns = instance.namespace().unwrap_or_default();
        let k = key(&ns, &instance.name_any());
        let mut inner = self.inner.write();
        if inner.instances.contains_key(&k) {
            return Err(Error::ResourceExists {
                kind: "PoolInstance".into(),
                name: instance.name_any(),
            });
        }
        let mut created = instance.clone();
        self.stamp_new(&mut created.metadata);
        inner.instances.insert(k, created.clone());
        debug!(instance = %created.name_any(), "instance created");
        Ok(created)
    }

    async fn update_instance(&self, instance: &PoolInstance) -> Result<PoolInstance> {
        self.maybe_fail("update_instance")?;
        let ns = instance.namespace().unwrap_or_default();
        let k = key(&ns, &instance.name_any());
        let mut inner = self.inner.write();
        let stored = inner
            .instances
            .get_mut(&k)
            .ok_or_else(|| Error::not_found("PoolInstance", instance.name_any()))?;
        Self::check_version(&stored.metadata, &instance.metadata, "PoolInstance")?;

        stored.spec = instance.spec.clone();
        stored.metadata.finalizers = instance.metadata.finalizers.clone();
        stored.metadata.labels = instance.metadata.labels.clone();
        stored.metadata.annotations = instance.metadata.annotations.clone();
        stored.metadata.resource_version = Some(self.next_version());
        let updated = stored.clone();

        if Self::finalizers_cleared(&updated.metadata) {
            inner.instances.remove(&k);
            inner.managers.remove(&k);
        }
        Ok(updated)
    }

    async fn update_instance_status(&self, instance: &PoolInstance) -> Result<PoolInstance> {
        self.maybe_fail("update_instance_status")?;
        let ns = instance.namespace().unwrap_or_default();
        let mut inner = self.inner.write();
        let stored = inner
            .instances
            .get_mut(&key(&ns, &instance.name_any()))
            .ok_or_else(|| Error::not_found("PoolInstance", instance.name_any()))?;
        Self::check_version(&stored.metadata, &instance.metadata, "PoolInstance")?;
        stored.status = instance.status.clone();
        stored.metadata.resource_version = Some(self.next_version());
        Ok(stored.clone())
    }

    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<()> {
        self.maybe_fail("delete_instance")?;
        let k = key(namespace, name);
        let mut inner = self.inner.write();
        let removal = match inner.instances.get_mut(&k) {
            Some(instance) => self.mark_or_remove(&mut instance.metadata),
            None => return Err(Error::not_found("PoolInstance", name)),
        };
        if let Removal::Removed = removal {
            inner.instances.remove(&k);
            inner.managers.remove(&k);
        }
        Ok(())
    }
}

// =============================================================================
// DeviceStore
// =============================================================================

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn get_block_device(&self, namespace: &str, name: &str) -> Result<BlockDevice> {
        self.inner
            .read()
            .devices
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("BlockDevice", name))
    }

    async fn list_block_devices(&self, namespace: &str) -> Result<Vec<BlockDevice>> {
        Ok(self
            .inner
            .read()
            .devices
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, bd)| bd.clone())
            .collect())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<BlockDeviceClaim>> {
        Ok(self.inner.read().claims.get(&key(namespace, name)).cloned())
    }

    async fn list_claims(&self, namespace: &str, cluster: &str) -> Result<Vec<BlockDeviceClaim>> {
        Ok(self
            .inner
            .read()
            .claims
            .iter()
            .filter(|((ns, _), c)| ns == namespace && has_cluster_label(c.labels(), cluster))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn create_claim(&self, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim> {
        self.maybe_fail("create_claim")?;
        let ns = claim.namespace().unwrap_or_default();
        let k = key(&ns, &claim.name_any());
        let mut inner = self.inner.write();
        if inner.claims.contains_key(&k) {
            return Err(Error::ResourceExists {
                kind: "BlockDeviceClaim".into(),
                name: claim.name_any(),
            });
        }
        let mut created = claim.clone();
        self.stamp_new(&mut created.metadata);
        inner.claims.insert(k, created.clone());

        // Bind the device the way the disk directory does
        if let Some(bd) = inner
            .devices
            .get_mut(&key(&ns, &claim.spec.block_device_name))
        {
            bd.spec.claim_ref = Some(ClaimReference {
                name: claim.name_any(),
                namespace: Some(ns.clone()),
            });
            let status = bd.status.get_or_insert_with(BlockDeviceStatus::default);
            status.claim_state = ClaimState::Claimed;
        }
        Ok(created)
    }

    async fn update_claim(&self, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim> {
        self.maybe_fail("update_claim")?;
        let ns = claim.namespace().unwrap_or_default();
        let k = key(&ns, &claim.name_any());
        let mut inner = self.inner.write();
        let stored = inner
            .claims
            .get_mut(&k)
            .ok_or_else(|| Error::not_found("BlockDeviceClaim", claim.name_any()))?;
        Self::check_version(&stored.metadata, &claim.metadata, "BlockDeviceClaim")?;

        stored.spec = claim.spec.clone();
        stored.metadata.finalizers = claim.metadata.finalizers.clone();
        stored.metadata.labels = claim.metadata.labels.clone();
        stored.metadata.resource_version = Some(self.next_version());
        let updated = stored.clone();

        if Self::finalizers_cleared(&updated.metadata) {
            inner.claims.remove(&k);
            Self::unbind_device(&mut inner, &ns, &updated.spec.block_device_name);
        }
        Ok(updated)
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        self.maybe_fail("delete_claim")?;
        let k = key(namespace, name);
        let mut inner = self.inner.write();
        let (removal, device) = match inner.claims.get_mut(&k) {
            Some(claim) => (
                self.mark_or_remove(&mut claim.metadata),
                claim.spec.block_device_name.clone(),
            ),
            None => return Err(Error::not_found("BlockDeviceClaim", name)),
        };
        if let Removal::Removed = removal {
            inner.claims.remove(&k);
            Self::unbind_device(&mut inner, namespace, &device);
        }
        Ok(())
    }
}

// =============================================================================
// NodeDirectory
// =============================================================================

#[async_trait]
impl NodeDirectory for MemoryStore {
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .nodes
            .iter()
            .filter(|(_, labels)| selector.iter().all(|(k, v)| labels.get(k) == Some(v)))
            .map(|(name, _)| name.clone())
            .collect())
    }
}

// =============================================================================
// RuntimeManagerStore
// =============================================================================

#[async_trait]
impl RuntimeManagerStore for MemoryStore {
    async fn list_managers(&self, namespace: &str, cluster: &str) -> Result<Vec<RuntimeManager>> {
        Ok(self
            .inner
            .read()
            .managers
            .iter()
            .filter(|((ns, _), m)| ns == namespace && m.cluster_name == cluster)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn create_manager(&self, manager: &RuntimeManager) -> Result<()> {
        self.maybe_fail("create_manager")?;
        let k = key(&manager.namespace, &manager.name);
        let mut inner = self.inner.write();
        if inner.managers.contains_key(&k) {
            return Err(Error::ResourceExists {
                kind: "Deployment".into(),
                name: manager.name.clone(),
            });
        }
        inner.managers.insert(k, manager.clone());
        Ok(())
    }

    async fn delete_manager(&self, namespace: &str, name: &str) -> Result<()> {
        self.inner
            .write()
            .managers
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Deployment", name))
    }
}

// =============================================================================
// ReplicaDirectory / EventRecorder
// =============================================================================

#[async_trait]
impl ReplicaDirectory for MemoryStore {
    async fn list_replicas(&self, namespace: &str, instance: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .replicas
            .iter()
            .filter(|((ns, _), pi)| ns == namespace && pi.as_str() == instance)
            .map(|((_, name), _)| name.clone())
            .collect())
    }
}

#[async_trait]
impl EventRecorder for MemoryStore {
    async fn publish(&self, event: ObjectEvent) {
        debug!(kind = %event.kind, name = %event.name, reason = %event.reason, "event");
        self.inner.write().events.push(event);
    }
}
