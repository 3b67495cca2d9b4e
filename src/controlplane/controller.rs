//! Controller runtimes
//!
//! In a cluster the kube-runtime `Controller` watches PoolClusters and the
//! PoolInstances they own. Standalone mode drives the same reconciler from
//! a [`WorkQueue`] fed by a periodic resync.

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::instance::InstanceController;
use super::metrics::Metrics;
use super::queue::{ObjectKey, QueueHandler, WorkQueue};
use super::reconciler::{ReconcileOutcome, Reconciler};
use crate::crd::{PoolCluster, PoolInstance};
use crate::error::{Error, ErrorAction, Result};

/// Delay used for errors that ask for backoff
const BACKOFF_DELAY: Duration = Duration::from_secs(5);

/// Shared state handed to every reconcile call
pub struct Context {
    pub reconciler: Arc<Reconciler>,
    pub instances: Arc<InstanceController>,
    pub metrics: Metrics,
}

impl Context {
    pub fn new(reconciler: Arc<Reconciler>, instances: Arc<InstanceController>, metrics: Metrics) -> Arc<Self> {
        Arc::new(Self {
            reconciler,
            instances,
            metrics,
        })
    }

    fn resync(&self) -> Duration {
        self.reconciler.config().resync_interval
    }

    /// Reconcile one cluster and record metrics
    async fn reconcile_cluster(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let started = self.metrics.start_reconcile();
        let result = self.reconciler.reconcile(namespace, name).await;
        self.metrics.record_reconcile(started, result.is_ok());
        if let Ok(ReconcileOutcome::Reconciled(summary)) = &result {
            self.metrics.record_instance_changes(
                summary.created,
                summary.deleted,
                summary.instances_updated,
            );
        }
        result
    }
}

/// How long to wait before retrying after `error`; `None` waits for a change
pub fn requeue_delay(error: &Error) -> Option<Duration> {
    match error.action() {
        ErrorAction::RequeueWithBackoff => Some(BACKOFF_DELAY),
        ErrorAction::RequeueAfter(delay) => Some(delay),
        ErrorAction::NoRequeue => None,
    }
}

fn to_action(delay: Option<Duration>) -> Action {
    match delay {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}

// =============================================================================
// Kubernetes mode
// =============================================================================

async fn reconcile_cluster(cluster: Arc<PoolCluster>, ctx: Arc<Context>) -> Result<Action> {
    let outcome = ctx
        .reconcile_cluster(&cluster.ns(), &cluster.name_any())
        .await?;
    Ok(to_action(outcome.requeue_after(ctx.resync())))
}

fn cluster_error_policy(cluster: Arc<PoolCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(cluster = %cluster.name_any(), error = %error, "reconcile failed");
    to_action(requeue_delay(error))
}

async fn reconcile_instance(instance: Arc<PoolInstance>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = instance.namespace().unwrap_or_default();
    ctx.instances
        .reconcile(&namespace, &instance.name_any())
        .await?;
    Ok(Action::await_change())
}

fn instance_error_policy(instance: Arc<PoolInstance>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(instance = %instance.name_any(), error = %error, "instance reconcile failed");
    to_action(requeue_delay(error))
}

/// Run the cluster and instance controllers until the token is cancelled
pub async fn run_kube(client: Client, namespace: &str, ctx: Arc<Context>, token: CancellationToken) {
    let clusters: Api<PoolCluster> = Api::namespaced(client.clone(), namespace);
    let owned: Api<PoolInstance> = Api::namespaced(client.clone(), namespace);
    let instances: Api<PoolInstance> = Api::namespaced(client, namespace);

    info!(namespace, "starting pool cluster controllers");

    let cluster_controller = Controller::new(clusters, watcher::Config::default())
        .owns(owned, watcher::Config::default())
        .run(reconcile_cluster, cluster_error_policy, ctx.clone())
        .take_until(token.cancelled())
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(cluster = %obj.name, "reconciled"),
                Err(e) => debug!(error = %e, "controller event"),
            }
        });

    let instance_controller = Controller::new(instances, watcher::Config::default())
        .run(reconcile_instance, instance_error_policy, ctx)
        .take_until(token.cancelled())
        .for_each(|result| async move {
            if let Ok((obj, _)) = result {
                debug!(instance = %obj.name, "instance reconciled");
            }
        });

    tokio::join!(cluster_controller, instance_controller);
    info!("controllers stopped");
}

// =============================================================================
// Standalone mode
// =============================================================================

struct ClusterWorker {
    ctx: Arc<Context>,
}

#[async_trait]
impl QueueHandler for ClusterWorker {
    async fn handle(&self, key: &ObjectKey) -> Option<Duration> {
        let resync = self.ctx.resync();
        match self.ctx.reconcile_cluster(&key.namespace, &key.name).await {
            // Periodic resync covers the regular interval
            Ok(outcome) => outcome.requeue_after(resync).filter(|d| *d < resync),
            Err(e) => {
                warn!(cluster = %key, error = %e, "reconcile failed");
                requeue_delay(&e)
            }
        }
    }
}

/// Resync every cluster of the namespace on an interval and let `workers`
/// tasks reconcile them until the token is cancelled
pub async fn run_standalone(
    ctx: Arc<Context>,
    namespace: &str,
    workers: usize,
    token: CancellationToken,
) -> Result<()> {
    let queue = WorkQueue::new();
    let handles = queue.run(
        workers,
        Arc::new(ClusterWorker { ctx: ctx.clone() }),
        token.clone(),
    );
    let mut ticker = tokio::time::interval(ctx.resync());
    info!(namespace, workers, "standalone reconcile loop started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                resync(&ctx, &queue, namespace).await;
            }
        }
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "queue worker panicked");
        }
    }
    info!("standalone reconcile loop stopped");
    Ok(())
}

async fn resync(ctx: &Context, queue: &WorkQueue, namespace: &str) {
    match ctx
        .reconciler
        .stores()
        .clusters
        .list_clusters(Some(namespace))
        .await
    {
        Ok(clusters) => {
            for cluster in clusters {
                queue.enqueue(ObjectKey::new(cluster.ns(), cluster.name_any()));
            }
        }
        Err(e) => warn!(error = %e, "failed to list pool clusters"),
    }
    match ctx.instances.sweep(namespace).await {
        Ok(0) => {}
        Ok(destroyed) => info!(destroyed, "pool instances released"),
        Err(e) => warn!(error = %e, "instance sweep failed"),
    }
    ctx.metrics.set_queue_depth(queue.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::instance::DetachedPoolEngine;
    use crate::controlplane::reconciler::ReconcilerConfig;
    use crate::crd::{PoolConfig, PoolSpec, RaidGroup, HOSTNAME_LABEL};
    use crate::crd::{BlockDevice, BlockDeviceSpec, BlockDeviceStatus, DeviceCapacity, DeviceState};
    use crate::domain::ports::{PoolClusterStore, PoolInstanceStore, Stores};
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    #[test]
    fn test_requeue_delay_follows_error_action() {
        assert_eq!(requeue_delay(&Error::TransientStore("x".into())), Some(BACKOFF_DELAY));
        assert_eq!(
            requeue_delay(&Error::ReplacementInProgress { device: "bd".into() }),
            Some(Duration::from_secs(30))
        );
        assert_eq!(requeue_delay(&Error::StructuralViolation("x".into())), None);
    }

    #[tokio::test]
    async fn test_standalone_loop_provisions_and_stops() {
        let store = MemoryStore::new();
        store.add_node(
            "worker-1",
            BTreeMap::from([(HOSTNAME_LABEL.to_string(), "worker-1".to_string())]),
        );
        let mut bd = BlockDevice::new(
            "bd-1",
            BlockDeviceSpec {
                node_name: "worker-1".into(),
                path: "/dev/sdb".into(),
                capacity: DeviceCapacity {
                    storage: "10Gi".into(),
                },
                filesystem: None,
                claim_ref: None,
            },
        );
        bd.metadata.namespace = Some("openebs".into());
        bd.status = Some(BlockDeviceStatus {
            state: DeviceState::Active,
            ..Default::default()
        });
        store.add_block_device(bd);
        store.add_cluster(PoolCluster::with_pools(
            "fleet",
            "openebs",
            vec![PoolSpec {
                node_selector: BTreeMap::from([(HOSTNAME_LABEL.to_string(), "worker-1".to_string())]),
                pool_config: PoolConfig::default(),
                data_raid_groups: vec![RaidGroup::new(["bd-1"])],
                write_cache_raid_groups: vec![],
            }],
        ));

        let stores = Stores::from_shared(store.clone());
        let reconciler = Reconciler::new(
            stores.clone(),
            ReconcilerConfig {
                resync_interval: Duration::from_millis(20),
                retry: RetryPolicy::immediate(3),
                ..Default::default()
            },
        );
        let instances = InstanceController::new(
            stores.instances.clone(),
            stores.events.clone(),
            Arc::new(DetachedPoolEngine),
            None,
        );
        let ctx = Context::new(reconciler, instances, Metrics::new().unwrap());
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let ctx = ctx.clone();
            let token = token.clone();
            async move { run_standalone(ctx, "openebs", 2, token).await }
        });

        for _ in 0..100 {
            if !store.list_instances("openebs", "fleet").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(store.list_instances("openebs", "fleet").await.unwrap().len(), 1);
        let cluster = store.get_cluster("openebs", "fleet").await.unwrap().unwrap();
        assert!(cluster.has_finalizer());
        let (_, body) = ctx.metrics.encode().unwrap();
        assert!(String::from_utf8(body).unwrap().contains("pool_fleet_reconciles_total"));
    }
}
