//! Fleet snapshot loader
//!
//! Seeds a [`MemoryStore`] from a YAML document describing nodes, block
//! devices and pool clusters. Used by standalone mode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::memory::MemoryStore;
use crate::crd::{BlockDevice, PoolCluster};
use crate::error::{Error, Result};

/// A node and its labels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A volume replica hosted on an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaRecord {
    pub name: String,
    pub pool_instance: String,
}

/// Contents of a fleet file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub block_devices: Vec<BlockDevice>,
    #[serde(default)]
    pub pool_clusters: Vec<PoolCluster>,
    #[serde(default)]
    pub replicas: Vec<ReplicaRecord>,
}

impl FleetSnapshot {
    /// Parse a snapshot from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse a snapshot file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read fleet file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Seed a fresh store. Objects without a namespace land in `namespace`.
    pub fn into_store(self, namespace: &str) -> Arc<MemoryStore> {
        let store = MemoryStore::new();

        for node in self.nodes {
            store.add_node(&node.name, node.labels);
        }
        for mut bd in self.block_devices {
            bd.metadata.namespace.get_or_insert_with(|| namespace.to_string());
            store.add_block_device(bd);
        }
        for mut cluster in self.pool_clusters {
            cluster.metadata.namespace.get_or_insert_with(|| namespace.to_string());
            store.add_cluster(cluster);
        }
        for replica in self.replicas {
            store.add_replica(namespace, &replica.name, &replica.pool_instance);
        }

        info!(
            nodes = store.node_count(),
            devices = store.device_count(),
            clusters = store.cluster_count(),
            "fleet snapshot loaded"
        );
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RaidType;
    use crate::domain::ports::{DeviceStore, NodeDirectory, PoolClusterStore};
    use std::io::Write;

    const FLEET: &str = r#"
nodes:
  - name: worker-1
    labels:
      kubernetes.io/hostname: worker-1
blockDevices:
  - apiVersion: storage.billyronks.io/v1
    kind: BlockDevice
    metadata:
      name: bd-1
    spec:
      nodeName: worker-1
      path: /dev/sdb
      capacity:
        storage: 100Gi
    status:
      claimState: Unclaimed
      state: Active
poolClusters:
  - apiVersion: storage.billyronks.io/v1
    kind: PoolCluster
    metadata:
      name: fleet
    spec:
      pools:
        - nodeSelector:
            kubernetes.io/hostname: worker-1
          poolConfig:
            dataRaidGroupType: stripe
          dataRaidGroups:
            - blockDevices:
                - blockDeviceName: bd-1
"#;

    #[tokio::test]
    async fn test_load_fleet_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FLEET.as_bytes()).unwrap();

        let snapshot = FleetSnapshot::load(file.path()).unwrap();
        assert_eq!(snapshot.nodes.len(), 1);
        let store = snapshot.into_store("openebs");

        let cluster = store.get_cluster("openebs", "fleet").await.unwrap().unwrap();
        assert_eq!(cluster.spec.pools.len(), 1);
        assert_eq!(cluster.spec.pools[0].pool_config.data_raid_group_type, RaidType::Stripe);

        let bd = store.get_block_device("openebs", "bd-1").await.unwrap();
        assert!(bd.is_active());
        assert!(bd.metadata.uid.is_some());

        let nodes = store.list_nodes(&BTreeMap::new()).await.unwrap();
        assert_eq!(nodes, vec!["worker-1".to_string()]);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = FleetSnapshot::load("/nonexistent/fleet.yaml").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            FleetSnapshot::from_yaml("nodes: [[["),
            Err(Error::YamlParse(_))
        ));
    }
}
