use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::DFT_WATCH_WAKE_INTERVAL;
use crate::error::ClusterError;
use crate::instance::Instance;
use crate::membership::{coalesce_send, Membership, WatchEvent, WatchStream, WATCH_CHANNEL_CAPACITY};

/// In-memory membership directory.
///
/// Used by tests and single-node deployments. `add_peer` / `remove_peer`
/// mutate the directory the way another node's register/lease-expiry
/// would, firing `InstancesChanged` at every watcher.
pub struct MemoryMembership {
    wake_interval: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Kept sorted by id: the directory contract promises lexicographic
    /// key order, and every id shares the cluster prefix.
    instances: Vec<Instance>,
    local: Option<Instance>,
    watchers: Vec<mpsc::UnboundedSender<()>>,
}

impl MemoryMembership {
    pub fn new() -> Self {
        Self::with_wake_interval(DFT_WATCH_WAKE_INTERVAL)
    }

    pub fn with_wake_interval(wake_interval: Duration) -> Self {
        Self {
            wake_interval,
            inner: Mutex::new(Inner {
                instances: Vec::new(),
                local: None,
                watchers: Vec::new(),
            }),
        }
    }

    /// Insert a (remote) instance into the directory.
    pub fn add_peer(&self, id: &str) {
        let mut inner = self.inner.lock();
        Self::insert_sorted(&mut inner, Instance::new(id));
        Self::notify(&mut inner);
    }

    /// Remove an instance from the directory, as lease expiry would.
    pub fn remove_peer(&self, id: &str) {
        let mut inner = self.inner.lock();
        inner.instances.retain(|ins| ins.id != id);
        Self::notify(&mut inner);
    }

    fn insert_sorted(inner: &mut Inner, instance: Instance) {
        if let Err(pos) = inner
            .instances
            .binary_search_by(|probe| probe.id.cmp(&instance.id))
        {
            inner.instances.insert(pos, instance);
        }
    }

    fn notify(inner: &mut Inner) {
        inner.watchers.retain(|tx| tx.send(()).is_ok());
    }
}

impl Default for MemoryMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Membership for MemoryMembership {
    async fn register(&self, id: Option<&str>) -> Result<Instance, ClusterError> {
        let mut inner = self.inner.lock();
        if let Some(local) = inner.local.as_ref() {
            return Ok(local.clone());
        }
        let instance = Instance::new(id.filter(|s| !s.is_empty()).unwrap_or("127.0.0.1"));
        Self::insert_sorted(&mut inner, instance.clone());
        inner.local = Some(instance.clone());
        Self::notify(&mut inner);
        Ok(instance)
    }

    async fn unregister(&self) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock();
        if let Some(local) = inner.local.take() {
            inner.instances.retain(|ins| ins.id != local.id);
            Self::notify(&mut inner);
        }
        Ok(())
    }

    async fn get_local(&self) -> Result<Instance, ClusterError> {
        self.inner
            .lock()
            .local
            .clone()
            .ok_or(ClusterError::NotRegistered)
    }

    async fn get_all(&self) -> Result<Vec<Instance>, ClusterError> {
        Ok(self.inner.lock().instances.clone())
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<WatchStream, ClusterError> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        self.inner.lock().watchers.push(notify_tx);

        let wake_interval = self.wake_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(wake_interval);
            ticker.tick().await;
            // Priming event: the subscriber must reconcile at least once.
            if tx.send(WatchEvent::InstancesChanged).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    Some(()) = notify_rx.recv() => {
                        coalesce_send(&tx, WatchEvent::InstancesChanged);
                    }
                    _ = ticker.tick() => {
                        coalesce_send(&tx, WatchEvent::WatchWake);
                    }
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
