//! Block device claims
//!
//! A claim binds one block device to one PoolCluster. Claim names derive
//! from the device uid, so two writers racing on the same device collide on
//! the store's create-if-absent semantics and exactly one of them wins.
//! A claim created to replace another device records that device in
//! `predecessorDevice` until the replacement completes.

use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::crd::{
    BlockDevice, BlockDeviceClaim, BlockDeviceClaimSpec, PoolCluster, CLUSTER_FINALIZER,
    CLUSTER_NAME_LABEL,
};
use crate::domain::ports::DeviceStore;
use crate::error::{Error, Result};
use crate::retry::{with_retry, RetryPolicy};

/// Reject tagged devices whose tag is not whitelisted by the cluster
pub fn check_tag(cluster: &PoolCluster, device: &BlockDevice) -> Result<()> {
    let (Some(allowed), Some(tag)) = (cluster.allowed_tags(), device.tag()) else {
        return Ok(());
    };
    if allowed.contains(tag) {
        Ok(())
    } else {
        Err(Error::TagNotAllowed {
            device: device.name_any(),
            tag: tag.to_string(),
        })
    }
}

/// Build the claim object binding `device` to `cluster`
pub fn build_claim(
    cluster: &PoolCluster,
    device: &BlockDevice,
    requested_storage: u64,
    predecessor: Option<&str>,
) -> BlockDeviceClaim {
    let mut claim = BlockDeviceClaim::new(
        &device.claim_name(),
        BlockDeviceClaimSpec {
            block_device_name: device.name_any(),
            node_name: device.spec.node_name.clone(),
            requested_storage,
            predecessor_device: predecessor.map(str::to_string),
        },
    );
    claim.metadata.namespace = Some(cluster.ns());
    claim.metadata.labels = Some(BTreeMap::from([(
        CLUSTER_NAME_LABEL.to_string(),
        cluster.name_any(),
    )]));
    claim.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]);
    claim.metadata.owner_references = cluster.controller_owner_ref(&()).map(|r| vec![r]);
    claim
}

/// Claims devices on behalf of a PoolCluster
#[derive(Clone)]
pub struct ClaimEngine {
    devices: Arc<dyn DeviceStore>,
    retry: RetryPolicy,
}

impl ClaimEngine {
    pub fn new(devices: Arc<dyn DeviceStore>, retry: RetryPolicy) -> Self {
        Self { devices, retry }
    }

    /// Claim a device for the cluster. Already claimed devices are left as they are.
    pub async fn claim_device(&self, cluster: &PoolCluster, device_name: &str) -> Result<()> {
        self.claim(cluster, device_name, None).await
    }

    /// Claim `new_device` as the replacement of `old_device`
    pub async fn claim_replacement(
        &self,
        cluster: &PoolCluster,
        new_device: &str,
        old_device: &str,
    ) -> Result<()> {
        self.claim(cluster, new_device, Some(old_device)).await
    }

    async fn claim(
        &self,
        cluster: &PoolCluster,
        device_name: &str,
        predecessor: Option<&str>,
    ) -> Result<()> {
        let ns = cluster.ns();
        let device = self.devices.get_block_device(&ns, device_name).await?;
        check_tag(cluster, &device)?;

        if device.is_claimed() {
            debug!(device = %device_name, "device already claimed");
            if let Some(old) = predecessor {
                self.mark_predecessor(cluster, &device, old).await?;
            }
            return Ok(());
        }

        let requested = device.capacity_bytes()?;
        let claim = build_claim(cluster, &device, requested, predecessor);
        let created = with_retry(&self.retry, "create claim", || self.devices.create_claim(&claim)).await;

        match created {
            Ok(_) => {
                info!(
                    cluster = %cluster.name_any(),
                    device = %device_name,
                    claim = %claim.name_any(),
                    predecessor = ?predecessor,
                    "block device claimed"
                );
                Ok(())
            }
            Err(Error::ResourceExists { .. }) => {
                // Lost the race: whoever won decides the owner
                match self.devices.get_claim(&ns, &claim.name_any()).await? {
                    Some(existing) if existing.is_owned_by(&cluster.name_any()) => {
                        if let Some(old) = predecessor {
                            self.set_predecessor(existing, old).await?;
                        }
                        Ok(())
                    }
                    Some(existing) => Err(Error::AlreadyInUse {
                        device: device_name.to_string(),
                        owner: existing.cluster_name().unwrap_or("unknown").to_string(),
                    }),
                    None => Err(Error::TransientStore(format!(
                        "claim {} vanished after conflict",
                        claim.name_any()
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Record `old` as predecessor on the claim of an already claimed device
    async fn mark_predecessor(
        &self,
        cluster: &PoolCluster,
        device: &BlockDevice,
        old: &str,
    ) -> Result<()> {
        let claim = self.owning_claim(cluster, device).await?;
        match claim {
            Some(claim) if claim.is_owned_by(&cluster.name_any()) => {
                self.set_predecessor(claim, old).await
            }
            Some(claim) => Err(Error::AlreadyInUse {
                device: device.name_any(),
                owner: claim.cluster_name().unwrap_or("unknown").to_string(),
            }),
            None => Err(Error::AlreadyInUse {
                device: device.name_any(),
                owner: "unknown".into(),
            }),
        }
    }

    async fn set_predecessor(&self, mut claim: BlockDeviceClaim, old: &str) -> Result<()> {
        if claim.predecessor() == Some(old) {
            return Ok(());
        }
        claim.spec.predecessor_device = Some(old.to_string());
        with_retry(&self.retry, "update claim", || self.devices.update_claim(&claim)).await?;
        Ok(())
    }

    /// Claim currently bound to the device
    async fn owning_claim(
        &self,
        cluster: &PoolCluster,
        device: &BlockDevice,
    ) -> Result<Option<BlockDeviceClaim>> {
        let name = device
            .spec
            .claim_ref
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| device.claim_name());
        self.devices.get_claim(&cluster.ns(), &name).await
    }

    /// Whether the device may be used by the cluster.
    ///
    /// Unclaimed devices and devices claimed by this cluster are usable.
    /// Inactive devices are not. A device claimed by someone else fails with
    /// `AlreadyInUse`.
    pub async fn is_usable(&self, cluster: &PoolCluster, device: &BlockDevice) -> Result<bool> {
        if !device.is_active() {
            return Ok(false);
        }
        if !device.is_claimed() {
            return Ok(true);
        }
        match self.owning_claim(cluster, device).await? {
            Some(claim) if claim.is_owned_by(&cluster.name_any()) => Ok(true),
            Some(claim) => Err(Error::AlreadyInUse {
                device: device.name_any(),
                owner: claim.cluster_name().unwrap_or("unknown").to_string(),
            }),
            None => Err(Error::AlreadyInUse {
                device: device.name_any(),
                owner: "unknown".into(),
            }),
        }
    }

    /// Look the device up by name and check usability
    pub async fn is_usable_by_name(&self, cluster: &PoolCluster, device_name: &str) -> Result<bool> {
        let device = self.devices.get_block_device(&cluster.ns(), device_name).await?;
        self.is_usable(cluster, &device).await
    }

    /// Devices named as predecessor by any claim of the cluster
    pub async fn predecessors_in_flight(&self, cluster: &PoolCluster) -> Result<HashSet<String>> {
        let claims = self
            .devices
            .list_claims(&cluster.ns(), &cluster.name_any())
            .await?;
        Ok(claims
            .iter()
            .filter_map(|c| c.predecessor().map(str::to_string))
            .collect())
    }

    /// Devices whose claim still names a predecessor, i.e. the incoming side
    /// of a replacement that has not completed
    pub async fn replacing_devices(&self, cluster: &PoolCluster) -> Result<HashSet<String>> {
        Ok(self
            .pending_replacements(cluster)
            .await?
            .into_iter()
            .map(|c| c.spec.block_device_name)
            .collect())
    }

    /// Claims of the cluster that are still replacing a device
    pub async fn pending_replacements(&self, cluster: &PoolCluster) -> Result<Vec<BlockDeviceClaim>> {
        let claims = self
            .devices
            .list_claims(&cluster.ns(), &cluster.name_any())
            .await?;
        Ok(claims.into_iter().filter(|c| c.predecessor().is_some()).collect())
    }

    /// Finish a replacement: clear the predecessor, then release the old device
    pub async fn complete_replacement(
        &self,
        cluster: &PoolCluster,
        mut claim: BlockDeviceClaim,
    ) -> Result<()> {
        let Some(old) = claim.spec.predecessor_device.take() else {
            return Ok(());
        };
        with_retry(&self.retry, "update claim", || self.devices.update_claim(&claim)).await?;

        let ns = cluster.ns();
        match self.devices.get_block_device(&ns, &old).await {
            Ok(device) => {
                if let Some(old_claim) = self.owning_claim(cluster, &device).await? {
                    if old_claim.is_owned_by(&cluster.name_any()) {
                        self.release(old_claim).await?;
                    }
                }
            }
            Err(Error::ResourceNotFound { .. }) => {
                debug!(device = %old, "predecessor device already gone");
            }
            Err(e) => return Err(e),
        }
        info!(
            cluster = %cluster.name_any(),
            device = %claim.spec.block_device_name,
            predecessor = %old,
            "replacement completed"
        );
        Ok(())
    }

    /// Strip the finalizer from every claim of the cluster and delete it
    pub async fn release_claims(&self, cluster: &PoolCluster) -> Result<usize> {
        let claims = self
            .devices
            .list_claims(&cluster.ns(), &cluster.name_any())
            .await?;
        let count = claims.len();
        for claim in claims {
            self.release(claim).await?;
        }
        if count > 0 {
            info!(cluster = %cluster.name_any(), claims = count, "device claims released");
        }
        Ok(count)
    }

    async fn release(&self, mut claim: BlockDeviceClaim) -> Result<()> {
        let ns = claim.namespace().unwrap_or_default();
        let name = claim.name_any();

        let finalizers = claim.finalizers_mut();
        let before = finalizers.len();
        finalizers.retain(|f| f != CLUSTER_FINALIZER);
        if finalizers.len() != before {
            match with_retry(&self.retry, "update claim", || self.devices.update_claim(&claim)).await {
                Ok(_) | Err(Error::ResourceNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        match self.devices.delete_claim(&ns, &name).await {
            Ok(()) | Err(Error::ResourceNotFound { .. }) => Ok(()),
            Err(e) => {
                warn!(claim = %name, error = %e, "failed to delete claim");
                Err(e)
            }
        }
    }
}
