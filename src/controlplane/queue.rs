//! Deduplicating work queue for standalone mode
//!
//! A key is handled by at most one worker at a time. Keys enqueued while
//! they are running are re-run once after the current run finishes, however
//! many times they were enqueued in between.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Namespace and name of a queued object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Queued,
    Running,
    /// Enqueued again while running
    RunningDirty,
}

/// Handles one key; returns a delay after which the key is enqueued again
#[async_trait]
pub trait QueueHandler: Send + Sync + 'static {
    async fn handle(&self, key: &ObjectKey) -> Option<Duration>;
}

pub struct WorkQueue {
    states: DashMap<ObjectKey, KeyState>,
    tx: mpsc::UnboundedSender<ObjectKey>,
    /// Shared by every worker; idle workers wait on the lock, the holder
    /// waits on the channel
    rx: Mutex<mpsc::UnboundedReceiver<ObjectKey>>,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            states: DashMap::new(),
            tx,
            rx: Mutex::new(rx),
        })
    }

    /// Add a key unless it is already waiting
    pub fn enqueue(&self, key: ObjectKey) {
        match self.states.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == KeyState::Running {
                    entry.insert(KeyState::RunningDirty);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(KeyState::Queued);
                if self.tx.send(key).is_err() {
                    debug!("queue closed, key dropped");
                }
            }
        }
    }

    /// Enqueue `key` after `delay`, unless the token is cancelled first
    pub fn enqueue_after(self: &Arc<Self>, key: ObjectKey, delay: Duration, token: CancellationToken) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.enqueue(key),
            }
        });
    }

    /// Keys waiting or running
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    async fn next(&self) -> Option<ObjectKey> {
        let key = self.rx.lock().await.recv().await?;
        self.states.insert(key.clone(), KeyState::Running);
        Some(key)
    }

    /// Mark a run finished; a dirty key goes back on the queue
    fn done(&self, key: &ObjectKey) {
        if let Entry::Occupied(mut entry) = self.states.entry(key.clone()) {
            if *entry.get() == KeyState::RunningDirty {
                entry.insert(KeyState::Queued);
                if self.tx.send(key.clone()).is_err() {
                    debug!("queue closed, key dropped");
                }
            } else {
                entry.remove();
            }
        }
    }

    /// Start `workers` tasks draining the queue until the token is cancelled
    pub fn run<H: QueueHandler>(
        self: &Arc<Self>,
        workers: usize,
        handler: Arc<H>,
        token: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|id| {
                let queue = self.clone();
                let handler = handler.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    loop {
                        let key = tokio::select! {
                            _ = token.cancelled() => break,
                            key = queue.next() => match key {
                                Some(key) => key,
                                None => break,
                            },
                        };
                        debug!(worker = id, key = %key, "processing");
                        let requeue = handler.handle(&key).await;
                        queue.done(&key);
                        if let Some(delay) = requeue {
                            queue.enqueue_after(key, delay, token.clone());
                        }
                    }
                    info!(worker = id, "queue worker stopped");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records keys and how many run at once
    #[derive(Default)]
    struct Recorder {
        seen: SyncMutex<Vec<String>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl QueueHandler for Recorder {
        async fn handle(&self, key: &ObjectKey) -> Option<Duration> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.seen.lock().push(key.to_string());
            self.running.fetch_sub(1, Ordering::SeqCst);
            None
        }
    }

    async fn drain(queue: &Arc<WorkQueue>) {
        for _ in 0..100 {
            if queue.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not drain");
    }

    #[tokio::test]
    async fn test_pending_duplicates_collapse() {
        let queue = WorkQueue::new();
        let key = ObjectKey::new("openebs", "fleet");
        queue.enqueue(key.clone());
        queue.enqueue(key.clone());
        queue.enqueue(key);
        assert_eq!(queue.len(), 1);

        let handler = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        queue.run(2, handler.clone(), token.clone());
        drain(&queue).await;
        token.cancel();

        assert_eq!(handler.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_while_running_reruns_once() {
        let queue = WorkQueue::new();
        let key = ObjectKey::new("openebs", "fleet");
        let handler = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        queue.run(4, handler.clone(), token.clone());

        queue.enqueue(key.clone());
        tokio::time::sleep(Duration::from_millis(5)).await;
        for _ in 0..5 {
            queue.enqueue(key.clone());
        }
        drain(&queue).await;
        token.cancel();

        assert_eq!(handler.seen.lock().len(), 2);
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_concurrently() {
        let queue = WorkQueue::new();
        let handler = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        for name in ["a", "b", "c"] {
            queue.enqueue(ObjectKey::new("openebs", name));
        }
        queue.run(3, handler.clone(), token.clone());
        drain(&queue).await;
        token.cancel();

        let mut seen = handler.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["openebs/a", "openebs/b", "openebs/c"]);
        assert!(handler.max_running.load(Ordering::SeqCst) > 1);
    }
}
