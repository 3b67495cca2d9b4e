//! VolumeReplica CRD
//!
//! A volume replica hosted on a pool instance. The operator only lists
//! these to protect pools that still serve data.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Replica of a volume placed on a PoolInstance.
/// Labeled with `storage.billyronks.io/pool-instance=<instance>`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "VolumeReplica",
    plural = "volumereplicas",
    shortname = "vr",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicaSpec {
    /// Volume this replica belongs to
    pub volume_name: String,

    /// Replica capacity
    #[serde(default)]
    pub capacity: String,
}
