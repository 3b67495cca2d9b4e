//! Kubernetes store
//!
//! Implements every port against the API server with `kube::Api`. Runtime
//! managers are realized as single-replica Deployments pinned to the
//! instance's node.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, Event, Node, ObjectReference, PodSpec, PodTemplateSpec, ResourceRequirements,
    Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, MicroTime, ObjectMeta};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, error};

use crate::crd::{
    BlockDevice, BlockDeviceClaim, PoolCluster, PoolInstance, ResourceSpec, TolerationSpec,
    VolumeReplica, API_GROUP, CLUSTER_NAME_LABEL, HOSTNAME_LABEL, POOL_INSTANCE_LABEL,
};
use crate::domain::ports::{
    DeviceStore, EventRecorder, EventType, NodeDirectory, ObjectEvent, PoolClusterStore,
    PoolInstanceStore, ReplicaDirectory, RuntimeManager, RuntimeManagerStore,
};
use crate::error::{Error, Result};
use crate::topology::format_selector;

/// Container name of the runtime manager
const MANAGER_CONTAINER: &str = "pool-manager";

/// Kubernetes-backed implementation of every store port
pub struct KubeStore {
    client: Client,
    /// Component name reported on published events
    reporter: String,
    /// Instance name reported on published events
    reporting_instance: String,
}

impl KubeStore {
    pub fn new(client: Client, reporter: &str) -> Arc<Self> {
        let reporting_instance =
            std::env::var("POD_NAME").unwrap_or_else(|_| reporter.to_string());
        Arc::new(Self {
            client,
            reporter: reporter.to_string(),
            reporting_instance,
        })
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn cluster_selector(cluster: &str) -> ListParams {
    ListParams::default().labels(&format!("{}={}", CLUSTER_NAME_LABEL, cluster))
}

fn require_ns<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::Internal(format!("{} has no namespace", obj.name_any())))
}

// =============================================================================
// PoolClusterStore
// =============================================================================

#[async_trait]
impl PoolClusterStore for KubeStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<PoolCluster>> {
        self.api::<PoolCluster>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, "PoolCluster", name))
    }

    async fn list_clusters(&self, namespace: Option<&str>) -> Result<Vec<PoolCluster>> {
        let api: Api<PoolCluster> = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(e, "PoolCluster", "*"))?;
        Ok(list.items)
    }

    async fn update_cluster(&self, cluster: &PoolCluster) -> Result<PoolCluster> {
        let name = cluster.name_any();
        self.api::<PoolCluster>(&cluster.ns())
            .replace(&name, &PostParams::default(), cluster)
            .await
            .map_err(|e| Error::from_kube(e, "PoolCluster", &name))
    }

    async fn update_cluster_status(&self, cluster: &PoolCluster) -> Result<PoolCluster> {
        let name = cluster.name_any();
        let data = serde_json::to_vec(cluster)?;
        self.api::<PoolCluster>(&cluster.ns())
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| Error::from_kube(e, "PoolCluster", &name))
    }
}

// =============================================================================
// PoolInstanceStore
// =============================================================================

#[async_trait]
impl PoolInstanceStore for KubeStore {
    async fn list_instances(&self, namespace: &str, cluster: &str) -> Result<Vec<PoolInstance>> {
        let list = self
            .api::<PoolInstance>(namespace)
            .list(&cluster_selector(cluster))
            .await
            .map_err(|e| Error::from_kube(e, "PoolInstance", cluster))?;
        Ok(list.items)
    }

    async fn list_all_instances(&self, namespace: &str) -> Result<Vec<PoolInstance>> {
        let list = self
            .api::<PoolInstance>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(e, "PoolInstance", "*"))?;
        Ok(list.items)
    }

    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<PoolInstance>> {
        self.api::<PoolInstance>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, "PoolInstance", name))
    }

    async fn create_instance(&self, instance: &PoolInstance) -> Result<PoolInstance> {
        let name = instance.name_any();
        self.api::<PoolInstance>(&require_ns(instance)?)
            .create(&PostParams::default(), instance)
            .await
            .map_err(|e| Error::from_kube(e, "PoolInstance", &name))
    }

    async fn update_instance(&self, instance: &PoolInstance) -> Result<PoolInstance> {
        let name = instance.name_any();
        self.api::<PoolInstance>(&require_ns(instance)?)
            .replace(&name, &PostParams::default(), instance)
            .await
            .map_err(|e| Error::from_kube(e, "PoolInstance", &name))
    }

    async fn update_instance_status(&self, instance: &PoolInstance) -> Result<PoolInstance> {
        let name = instance.name_any();
        let data = serde_json::to_vec(instance)?;
        self.api::<PoolInstance>(&require_ns(instance)?)
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| Error::from_kube(e, "PoolInstance", &name))
    }

    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<PoolInstance>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, "PoolInstance", name))
    }
}

// =============================================================================
// DeviceStore
// =============================================================================

#[async_trait]
impl DeviceStore for KubeStore {
    async fn get_block_device(&self, namespace: &str, name: &str) -> Result<BlockDevice> {
        self.api::<BlockDevice>(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, "BlockDevice", name))
    }

    async fn list_block_devices(&self, namespace: &str) -> Result<Vec<BlockDevice>> {
        let list = self
            .api::<BlockDevice>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(e, "BlockDevice", "*"))?;
        Ok(list.items)
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<BlockDeviceClaim>> {
        self.api::<BlockDeviceClaim>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, "BlockDeviceClaim", name))
    }

    async fn list_claims(&self, namespace: &str, cluster: &str) -> Result<Vec<BlockDeviceClaim>> {
        let list = self
            .api::<BlockDeviceClaim>(namespace)
            .list(&cluster_selector(cluster))
            .await
            .map_err(|e| Error::from_kube(e, "BlockDeviceClaim", cluster))?;
        Ok(list.items)
    }

    async fn create_claim(&self, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim> {
        let name = claim.name_any();
        self.api::<BlockDeviceClaim>(&require_ns(claim)?)
            .create(&PostParams::default(), claim)
            .await
            .map_err(|e| Error::from_kube(e, "BlockDeviceClaim", &name))
    }

    async fn update_claim(&self, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim> {
        let name = claim.name_any();
        self.api::<BlockDeviceClaim>(&require_ns(claim)?)
            .replace(&name, &PostParams::default(), claim)
            .await
            .map_err(|e| Error::from_kube(e, "BlockDeviceClaim", &name))
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<BlockDeviceClaim>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, "BlockDeviceClaim", name))
    }
}

// =============================================================================
// NodeDirectory / ReplicaDirectory
// =============================================================================

#[async_trait]
impl NodeDirectory for KubeStore {
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<String>> {
        let rendered = format_selector(selector);
        let mut lp = ListParams::default();
        if !rendered.is_empty() {
            lp = lp.labels(&rendered);
        }
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&lp)
            .await
            .map_err(|e| Error::from_kube(e, "Node", &rendered))?;
        Ok(list.items.iter().map(|n| n.name_any()).collect())
    }
}

#[async_trait]
impl ReplicaDirectory for KubeStore {
    async fn list_replicas(&self, namespace: &str, instance: &str) -> Result<Vec<String>> {
        let lp = ListParams::default().labels(&format!("{}={}", POOL_INSTANCE_LABEL, instance));
        let list = self
            .api::<VolumeReplica>(namespace)
            .list(&lp)
            .await
            .map_err(|e| Error::from_kube(e, "VolumeReplica", instance))?;
        Ok(list.items.iter().map(|r| r.name_any()).collect())
    }
}

// =============================================================================
// RuntimeManagerStore
// =============================================================================

fn quantities(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if map.is_empty() {
        return None;
    }
    Some(
        map.iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
    )
}

fn strings(map: Option<&BTreeMap<String, Quantity>>) -> BTreeMap<String, String> {
    map.map(|m| m.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
        .unwrap_or_default()
}

fn manager_deployment(manager: &RuntimeManager) -> Deployment {
    let selector = BTreeMap::from([(POOL_INSTANCE_LABEL.to_string(), manager.name.clone())]);
    let mut labels = selector.clone();
    labels.insert(CLUSTER_NAME_LABEL.to_string(), manager.cluster_name.clone());

    let tolerations: Vec<Toleration> = manager
        .tolerations
        .iter()
        .map(|t| Toleration {
            key: t.key.clone(),
            operator: t.operator.clone(),
            value: t.value.clone(),
            effect: t.effect.clone(),
            toleration_seconds: t.toleration_seconds,
        })
        .collect();

    Deployment {
        metadata: ObjectMeta {
            name: Some(manager.name.clone()),
            namespace: Some(manager.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_selector: Some(BTreeMap::from([(
                        HOSTNAME_LABEL.to_string(),
                        manager.node_name.clone(),
                    )])),
                    priority_class_name: manager.priority_class_name.clone(),
                    tolerations: (!tolerations.is_empty()).then_some(tolerations),
                    containers: vec![Container {
                        name: MANAGER_CONTAINER.to_string(),
                        image: Some(manager.image.clone()),
                        args: Some(vec![format!("--pool-instance={}", manager.name)]),
                        resources: manager.resources.as_ref().map(|r| ResourceRequirements {
                            requests: quantities(&r.requests),
                            limits: quantities(&r.limits),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn manager_from_deployment(deployment: &Deployment) -> RuntimeManager {
    let pod = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref());
    let container = pod.and_then(|p| p.containers.first());

    RuntimeManager {
        name: deployment.name_any(),
        namespace: deployment.namespace().unwrap_or_default(),
        cluster_name: deployment
            .labels()
            .get(CLUSTER_NAME_LABEL)
            .cloned()
            .unwrap_or_default(),
        node_name: pod
            .and_then(|p| p.node_selector.as_ref())
            .and_then(|s| s.get(HOSTNAME_LABEL).cloned())
            .unwrap_or_default(),
        image: container
            .and_then(|c| c.image.clone())
            .unwrap_or_default(),
        resources: container
            .and_then(|c| c.resources.as_ref())
            .map(|r| ResourceSpec {
                requests: strings(r.requests.as_ref()),
                limits: strings(r.limits.as_ref()),
            }),
        tolerations: pod
            .and_then(|p| p.tolerations.as_ref())
            .map(|ts| {
                ts.iter()
                    .map(|t| TolerationSpec {
                        key: t.key.clone(),
                        operator: t.operator.clone(),
                        value: t.value.clone(),
                        effect: t.effect.clone(),
                        toleration_seconds: t.toleration_seconds,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        priority_class_name: pod.and_then(|p| p.priority_class_name.clone()),
        ready_replicas: deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0),
    }
}

#[async_trait]
impl RuntimeManagerStore for KubeStore {
    async fn list_managers(&self, namespace: &str, cluster: &str) -> Result<Vec<RuntimeManager>> {
        let list = self
            .api::<Deployment>(namespace)
            .list(&cluster_selector(cluster))
            .await
            .map_err(|e| Error::from_kube(e, "Deployment", cluster))?;
        Ok(list.items.iter().map(manager_from_deployment).collect())
    }

    async fn create_manager(&self, manager: &RuntimeManager) -> Result<()> {
        self.api::<Deployment>(&manager.namespace)
            .create(&PostParams::default(), &manager_deployment(manager))
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, "Deployment", &manager.name))
    }

    async fn delete_manager(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<Deployment>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, "Deployment", name))
    }
}

// =============================================================================
// EventRecorder
// =============================================================================

#[async_trait]
impl EventRecorder for KubeStore {
    async fn publish(&self, event: ObjectEvent) {
        let time = Utc::now();
        let events: Api<Event> = self.api(&event.namespace);
        let type_ = match event.event_type {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        };

        let record = Event {
            metadata: ObjectMeta {
                // must be unique for every event we post
                generate_name: Some(format!("{}.{:x}.", event.name, time.timestamp())),
                namespace: Some(event.namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some(format!("{}/v1", API_GROUP)),
                kind: Some(event.kind.clone()),
                name: Some(event.name.clone()),
                namespace: Some(event.namespace.clone()),
                ..Default::default()
            },
            event_time: Some(MicroTime(time)),
            action: Some(event.action.clone()),
            reason: Some(event.reason.clone()),
            message: Some(event.message.clone()),
            type_: Some(type_.to_string()),
            reporting_component: Some(self.reporter.clone()),
            reporting_instance: Some(self.reporting_instance.clone()),
            ..Default::default()
        };

        match events.create(&PostParams::default(), &record).await {
            Ok(_) => debug!(kind = %event.kind, name = %event.name, reason = %event.reason, "event published"),
            Err(error) => error!(?error, name = %event.name, "failed to publish event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RuntimeManager {
        RuntimeManager {
            name: "fleet-a1b2".into(),
            namespace: "openebs".into(),
            cluster_name: "fleet".into(),
            node_name: "worker-1".into(),
            image: "pool-manager:1.0".into(),
            resources: Some(ResourceSpec {
                requests: BTreeMap::from([("cpu".to_string(), "100m".to_string())]),
                limits: BTreeMap::new(),
            }),
            tolerations: vec![TolerationSpec {
                key: Some("storage".into()),
                operator: Some("Exists".into()),
                ..Default::default()
            }],
            priority_class_name: Some("system-node-critical".into()),
            ready_replicas: 0,
        }
    }

    #[test]
    fn test_manager_deployment_shape() {
        let deployment = manager_deployment(&manager());
        assert_eq!(deployment.labels().get(CLUSTER_NAME_LABEL).unwrap(), "fleet");

        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(
            pod.node_selector.as_ref().unwrap().get(HOSTNAME_LABEL).unwrap(),
            "worker-1"
        );
        assert_eq!(pod.containers[0].image.as_deref(), Some("pool-manager:1.0"));
    }

    #[test]
    fn test_manager_survives_deployment_conversion() {
        let original = manager();
        let back = manager_from_deployment(&manager_deployment(&original));
        assert_eq!(back, original);
    }
}
