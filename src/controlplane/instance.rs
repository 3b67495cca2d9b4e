//! Instance-level controller
//!
//! Runs next to the physical pools. It only looks at PoolInstances hosted
//! on its own node and is responsible for destroying the pool before the
//! protection finalizer is released.

use async_trait::async_trait;
use kube::ResourceExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{InstancePhase, PoolInstance, PoolInstanceStatus, POOL_PROTECTION_FINALIZER};
use crate::domain::ports::{EventRecorder, ObjectEvent, PoolEngine, PoolInstanceStore};
use crate::error::{Error, Result};

const KIND: &str = "PoolInstance";

// =============================================================================
// Pool Engines
// =============================================================================

/// Drives the volume-manager binary: `<binary> destroy <pool>`
#[derive(Debug, Clone)]
pub struct CommandPoolEngine {
    binary: PathBuf,
}

impl CommandPoolEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl PoolEngine for CommandPoolEngine {
    async fn destroy(&self, instance: &PoolInstance) -> Result<()> {
        let pool = instance.name_any();
        let output = Command::new(&self.binary)
            .arg("destroy")
            .arg(&pool)
            .output()
            .await
            .map_err(|e| Error::PoolDestroy {
                instance: pool.clone(),
                reason: format!("cannot run {}: {}", self.binary.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::PoolDestroy {
                instance: pool,
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        debug!(pool = %pool, "pool destroyed");
        Ok(())
    }
}

/// Engine used when no volume-manager binary is configured
#[derive(Debug, Clone, Default)]
pub struct DetachedPoolEngine;

#[async_trait]
impl PoolEngine for DetachedPoolEngine {
    async fn destroy(&self, instance: &PoolInstance) -> Result<()> {
        info!(pool = %instance.name_any(), "no pool binary configured, releasing instance");
        Ok(())
    }
}

// =============================================================================
// Controller
// =============================================================================

/// What one instance pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceOutcome {
    NotFound,
    /// Hosted on another node
    NotMine,
    Idle,
    Destroyed,
}

/// Handles deletion of the PoolInstances hosted on one node
pub struct InstanceController {
    instances: Arc<dyn PoolInstanceStore>,
    events: Arc<dyn EventRecorder>,
    engine: Arc<dyn PoolEngine>,
    /// Host name of this process; `None` handles every instance
    identity: Option<String>,
}

impl InstanceController {
    pub fn new(
        instances: Arc<dyn PoolInstanceStore>,
        events: Arc<dyn EventRecorder>,
        engine: Arc<dyn PoolEngine>,
        identity: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            instances,
            events,
            engine,
            identity,
        })
    }

    /// Whether this process manages the instance
    pub fn owns(&self, instance: &PoolInstance) -> bool {
        self.identity
            .as_deref()
            .map(|id| id == instance.host_name())
            .unwrap_or(true)
    }

    #[instrument(skip_all, fields(namespace = %namespace, instance = %name))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<InstanceOutcome> {
        let Some(instance) = self.instances.get_instance(namespace, name).await? else {
            return Ok(InstanceOutcome::NotFound);
        };
        if !self.owns(&instance) {
            return Ok(InstanceOutcome::NotMine);
        }
        if !instance.is_deleting() || !instance.has_protection_finalizer() {
            return Ok(InstanceOutcome::Idle);
        }

        match self.engine.destroy(&instance).await {
            Ok(()) => {
                self.release(instance).await?;
                info!("pool destroyed, protection finalizer removed");
                Ok(InstanceOutcome::Destroyed)
            }
            Err(e) => {
                error!(error = %e, "pool destroy failed, keeping finalizer");
                self.mark_failed(&instance, &e).await;
                Err(e)
            }
        }
    }

    /// Pass over every instance in the namespace
    pub async fn sweep(&self, namespace: &str) -> Result<usize> {
        let mut destroyed = 0;
        for instance in self.instances.list_all_instances(namespace).await? {
            if !instance.is_deleting() || !self.owns(&instance) {
                continue;
            }
            match self.reconcile(namespace, &instance.name_any()).await {
                Ok(InstanceOutcome::Destroyed) => destroyed += 1,
                Ok(_) => {}
                Err(e) => debug!(instance = %instance.name_any(), error = %e, "instance left for next sweep"),
            }
        }
        Ok(destroyed)
    }

    async fn release(&self, mut instance: PoolInstance) -> Result<()> {
        instance
            .finalizers_mut()
            .retain(|f| f != POOL_PROTECTION_FINALIZER);
        match self.instances.update_instance(&instance).await {
            Ok(_) | Err(Error::ResourceNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn mark_failed(&self, instance: &PoolInstance, err: &Error) {
        let mut failed = instance.clone();
        let status = failed.status.get_or_insert_with(PoolInstanceStatus::default);
        status.phase = InstancePhase::DeletionFailed;
        if let Err(e) = self.instances.update_instance_status(&failed).await {
            warn!(error = %e, "failed to record DeletionFailed phase");
        }
        self.events
            .publish(
                ObjectEvent::warning(
                    KIND,
                    &instance.name_any(),
                    &instance.namespace().unwrap_or_default(),
                    "DestroyFailed",
                    err.to_string(),
                )
                .with_action("Destroy"),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PoolConfig, PoolInstanceSpec};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    const NS: &str = "openebs";

    /// Fails the first `failures` destroy calls
    #[derive(Default)]
    struct FlakyEngine {
        failures: Mutex<u32>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PoolEngine for FlakyEngine {
        async fn destroy(&self, instance: &PoolInstance) -> Result<()> {
            self.calls.lock().push(instance.name_any());
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::PoolDestroy {
                    instance: instance.name_any(),
                    reason: "pool busy".into(),
                });
            }
            Ok(())
        }
    }

    async fn seed(store: &Arc<MemoryStore>, name: &str, host: &str) {
        let mut pi = PoolInstance::new(
            name,
            PoolInstanceSpec {
                host_name: host.into(),
                node_selector: BTreeMap::new(),
                pool_config: PoolConfig::default(),
                data_raid_groups: vec![],
                write_cache_raid_groups: vec![],
            },
        );
        pi.metadata.namespace = Some(NS.into());
        pi.metadata.finalizers = Some(vec![POOL_PROTECTION_FINALIZER.to_string()]);
        store.create_instance(&pi).await.unwrap();
        store.delete_instance(NS, name).await.unwrap();
    }

    fn controller(store: &Arc<MemoryStore>, engine: Arc<FlakyEngine>, identity: Option<&str>) -> Arc<InstanceController> {
        InstanceController::new(store.clone(), store.clone(), engine, identity.map(str::to_string))
    }

    #[tokio::test]
    async fn test_destroy_releases_finalizer() {
        let store = MemoryStore::new();
        seed(&store, "fleet-1", "worker-1").await;
        let engine = Arc::new(FlakyEngine::default());
        let ctrl = controller(&store, engine.clone(), Some("worker-1"));

        let outcome = ctrl.reconcile(NS, "fleet-1").await.unwrap();
        assert_eq!(outcome, InstanceOutcome::Destroyed);
        assert!(store.get_instance(NS, "fleet-1").await.unwrap().is_none());
        assert_eq!(engine.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_failure_keeps_finalizer() {
        let store = MemoryStore::new();
        seed(&store, "fleet-1", "worker-1").await;
        let engine = Arc::new(FlakyEngine {
            failures: Mutex::new(1),
            ..Default::default()
        });
        let ctrl = controller(&store, engine, None);

        assert_matches!(ctrl.reconcile(NS, "fleet-1").await, Err(Error::PoolDestroy { .. }));
        let pi = store.get_instance(NS, "fleet-1").await.unwrap().unwrap();
        assert!(pi.has_protection_finalizer());
        assert_eq!(pi.phase(), InstancePhase::DeletionFailed);
        assert!(store.events().iter().any(|e| e.reason == "DestroyFailed"));

        // Retried on the next pass
        assert_eq!(ctrl.reconcile(NS, "fleet-1").await.unwrap(), InstanceOutcome::Destroyed);
        assert!(store.get_instance(NS, "fleet-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_identity_filter() {
        let store = MemoryStore::new();
        seed(&store, "fleet-1", "worker-1").await;
        seed(&store, "fleet-2", "worker-2").await;
        let engine = Arc::new(FlakyEngine::default());
        let ctrl = controller(&store, engine.clone(), Some("worker-2"));

        assert_eq!(ctrl.reconcile(NS, "fleet-1").await.unwrap(), InstanceOutcome::NotMine);
        assert_eq!(ctrl.sweep(NS).await.unwrap(), 1);
        assert!(store.get_instance(NS, "fleet-1").await.unwrap().is_some());
        assert_eq!(*engine.calls.lock(), vec!["fleet-2".to_string()]);
    }

    #[tokio::test]
    async fn test_command_engine_reports_failure() {
        let engine = CommandPoolEngine::new("/nonexistent/pool-binary");
        let pi = PoolInstance::new(
            "fleet-1",
            PoolInstanceSpec {
                host_name: "worker-1".into(),
                node_selector: BTreeMap::new(),
                pool_config: PoolConfig::default(),
                data_raid_groups: vec![],
                write_cache_raid_groups: vec![],
            },
        );
        assert_matches!(engine.destroy(&pi).await, Err(Error::PoolDestroy { reason, .. }) if reason.contains("cannot run"));
    }
}
