//! Domain Ports - Core trait definitions for the pool fleet operator
//!
//! These traits define the boundaries between the topology engine and the
//! stores it reads and mutates. Adapters implement these traits to provide
//! concrete functionality (Kubernetes API, in-memory).

use crate::crd::{
    BlockDevice, BlockDeviceClaim, PoolCluster, PoolInstance, ResourceSpec, TolerationSpec,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Runtime Manager
// =============================================================================

/// The per-instance process that operates a physical pool.
/// Realized as a Deployment named after its PoolInstance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeManager {
    /// Same name as the PoolInstance
    pub name: String,
    pub namespace: String,
    /// Owning PoolCluster
    pub cluster_name: String,
    /// Node the manager is pinned to
    pub node_name: String,
    /// Container image
    pub image: String,
    pub resources: Option<ResourceSpec>,
    pub tolerations: Vec<TolerationSpec>,
    pub priority_class_name: Option<String>,
    /// Ready replicas as last observed
    pub ready_replicas: i32,
}

impl RuntimeManager {
    pub fn is_available(&self) -> bool {
        self.ready_replicas >= 1
    }
}

// =============================================================================
// Events
// =============================================================================

/// Severity of a published event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

/// A user-visible event about a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEvent {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub event_type: EventType,
    /// Short machine readable reason
    pub reason: String,
    /// Action taken or attempted
    pub action: String,
    pub message: String,
}

impl ObjectEvent {
    pub fn normal(kind: &str, name: &str, namespace: &str, reason: &str, message: impl Into<String>) -> Self {
        Self::build(EventType::Normal, kind, name, namespace, reason, message.into())
    }

    pub fn warning(kind: &str, name: &str, namespace: &str, reason: &str, message: impl Into<String>) -> Self {
        Self::build(EventType::Warning, kind, name, namespace, reason, message.into())
    }

    fn build(
        event_type: EventType,
        kind: &str,
        name: &str,
        namespace: &str,
        reason: &str,
        message: String,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            event_type,
            reason: reason.to_string(),
            action: "Reconcile".to_string(),
            message,
        }
    }

    pub fn with_action(mut self, action: &str) -> Self {
        self.action = action.to_string();
        self
    }
}

// =============================================================================
// Store Ports
// =============================================================================

/// Desired-state store
#[async_trait]
pub trait PoolClusterStore: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<PoolCluster>>;

    /// List clusters in a namespace, or in every namespace
    async fn list_clusters(&self, namespace: Option<&str>) -> Result<Vec<PoolCluster>>;

    /// Replace metadata and spec
    async fn update_cluster(&self, cluster: &PoolCluster) -> Result<PoolCluster>;

    /// Replace status only
    async fn update_cluster_status(&self, cluster: &PoolCluster) -> Result<PoolCluster>;
}

/// Observed-state store
#[async_trait]
pub trait PoolInstanceStore: Send + Sync {
    /// Instances labeled with the given cluster name
    async fn list_instances(&self, namespace: &str, cluster: &str) -> Result<Vec<PoolInstance>>;

    /// Every instance in the namespace
    async fn list_all_instances(&self, namespace: &str) -> Result<Vec<PoolInstance>>;

    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<PoolInstance>>;

    async fn create_instance(&self, instance: &PoolInstance) -> Result<PoolInstance>;

    /// Replace metadata and spec
    async fn update_instance(&self, instance: &PoolInstance) -> Result<PoolInstance>;

    /// Replace status only
    async fn update_instance_status(&self, instance: &PoolInstance) -> Result<PoolInstance>;

    /// Request deletion; finalizers delay the actual removal
    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Block device directory and claim store
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Fails with `ResourceNotFound` when the device does not exist
    async fn get_block_device(&self, namespace: &str, name: &str) -> Result<BlockDevice>;

    async fn list_block_devices(&self, namespace: &str) -> Result<Vec<BlockDevice>>;

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<BlockDeviceClaim>>;

    /// Claims labeled with the given cluster name
    async fn list_claims(&self, namespace: &str, cluster: &str) -> Result<Vec<BlockDeviceClaim>>;

    /// Create-if-absent; fails with `ResourceExists` when the name is taken
    async fn create_claim(&self, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim>;

    async fn update_claim(&self, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim>;

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Node directory, used for name resolution only
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Names of nodes whose labels match every entry of the selector
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<String>>;
}

/// Runtime manager store
#[async_trait]
pub trait RuntimeManagerStore: Send + Sync {
    async fn list_managers(&self, namespace: &str, cluster: &str) -> Result<Vec<RuntimeManager>>;

    async fn create_manager(&self, manager: &RuntimeManager) -> Result<()>;

    async fn delete_manager(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Consumers hosted on a pool instance
#[async_trait]
pub trait ReplicaDirectory: Send + Sync {
    /// Names of volume replicas living on the instance
    async fn list_replicas(&self, namespace: &str, instance: &str) -> Result<Vec<String>>;
}

/// Kubernetes event sink
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Best effort; failures are logged by the implementation
    async fn publish(&self, event: ObjectEvent);
}

/// Physical pool engine, driven by the instance-level controller
#[async_trait]
pub trait PoolEngine: Send + Sync {
    /// Destroy the physical pool backing the instance
    async fn destroy(&self, instance: &PoolInstance) -> Result<()>;
}

// =============================================================================
// Store Bundle
// =============================================================================

/// Every store the topology engine talks to
#[derive(Clone)]
pub struct Stores {
    pub clusters: Arc<dyn PoolClusterStore>,
    pub instances: Arc<dyn PoolInstanceStore>,
    pub devices: Arc<dyn DeviceStore>,
    pub nodes: Arc<dyn NodeDirectory>,
    pub managers: Arc<dyn RuntimeManagerStore>,
    pub replicas: Arc<dyn ReplicaDirectory>,
    pub events: Arc<dyn EventRecorder>,
}

impl Stores {
    /// Bundle a single adapter that implements every port
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: PoolClusterStore
            + PoolInstanceStore
            + DeviceStore
            + NodeDirectory
            + RuntimeManagerStore
            + ReplicaDirectory
            + EventRecorder
            + 'static,
    {
        Self {
            clusters: store.clone(),
            instances: store.clone(),
            devices: store.clone(),
            nodes: store.clone(),
            managers: store.clone(),
            replicas: store.clone(),
            events: store,
        }
    }
}
