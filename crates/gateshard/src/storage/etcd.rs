use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseGrantOptions, PutOptions, WatchOptions,
};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::instance::{local_host_ip, Instance};
use crate::membership::{coalesce_send, Membership, WatchEvent, WatchStream, WATCH_CHANNEL_CAPACITY};

/// Back-off before re-establishing a broken watch stream.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Lease-backed membership directory over etcd.
///
/// One client is connected up front and shared for the lifetime of the
/// directory. Liveness is a lease of `hb_interval * hb_timeout_factor`
/// seconds renewed by a background heartbeat; peers observe expiry as a
/// delete event on the cluster prefix.
pub struct EtcdMembership {
    config: ClusterConfig,
    client: Arc<Mutex<Client>>,
    local: Mutex<Option<Instance>>,
    /// Lease backing the local registration. 0 = no live lease; the next
    /// heartbeat tick re-grants and re-puts.
    lease_id: Arc<parking_lot::Mutex<i64>>,
    /// Cancels the heartbeat task. Kept outside `local` so `Drop` can
    /// reach it synchronously.
    hb_cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

impl EtcdMembership {
    /// Validate the configuration and connect the shared client.
    pub async fn connect(config: ClusterConfig) -> Result<Self, ClusterError> {
        config.validate()?;
        let options = ConnectOptions::new()
            .with_connect_timeout(config.etcd_timeout)
            .with_timeout(config.etcd_timeout);
        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(map_err)?;
        Ok(Self {
            config,
            client: Arc::new(Mutex::new(client)),
            local: Mutex::new(None),
            lease_id: Arc::new(parking_lot::Mutex::new(0)),
            hb_cancel: parking_lot::Mutex::new(None),
        })
    }

    fn spawn_heartbeat(&self, key: String, cancel: CancellationToken) {
        let client = Arc::clone(&self.client);
        let lease_id = Arc::clone(&self.lease_id);
        let interval = self.config.hb_interval;
        let ttl = self.config.lease_ttl_secs();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let current = *lease_id.lock();
                        if current != 0 {
                            if let Err(e) = keep_alive_once(&client, current).await {
                                warn!(lease = current, error = %e, "lease keep-alive failed");
                                // Clear the lease; the next tick re-puts.
                                *lease_id.lock() = 0;
                            }
                        } else {
                            match put_node(&client, &key, ttl).await {
                                Ok(lease) => {
                                    *lease_id.lock() = lease;
                                    info!(key = %key, lease, "re-registered after lease loss");
                                }
                                Err(e) => {
                                    warn!(key = %key, error = %e, "heartbeat re-registration failed");
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Membership for EtcdMembership {
    async fn register(&self, id: Option<&str>) -> Result<Instance, ClusterError> {
        let mut local = self.local.lock().await;
        if let Some(instance) = local.as_ref() {
            return Ok(instance.clone());
        }
        let id = match id.filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => local_host_ip()?,
        };
        let instance = Instance::new(id);
        let key = instance.key(&self.config.cluster_name);
        let lease = put_node(&self.client, &key, self.config.lease_ttl_secs()).await?;
        *self.lease_id.lock() = lease;

        let cancel = CancellationToken::new();
        self.spawn_heartbeat(key.clone(), cancel.clone());
        *self.hb_cancel.lock() = Some(cancel);

        info!(key = %key, lease, "instance registered");
        *local = Some(instance.clone());
        Ok(instance)
    }

    async fn unregister(&self) -> Result<(), ClusterError> {
        let mut local = self.local.lock().await;
        let Some(instance) = local.take() else {
            return Ok(());
        };
        if let Some(cancel) = self.hb_cancel.lock().take() {
            cancel.cancel();
        }
        let key = instance.key(&self.config.cluster_name);
        let lease = std::mem::replace(&mut *self.lease_id.lock(), 0);

        // Best-effort cleanup: a failed delete or revoke leaves the key to
        // expire via its TTL.
        let mut client = self.client.lock().await;
        if let Err(e) = client.delete(key.as_str(), None).await {
            warn!(key = %key, error = %e, "failed to delete instance key");
        }
        if lease != 0 {
            if let Err(e) = client.lease_revoke(lease).await {
                warn!(lease, error = %e, "failed to revoke lease");
            }
        }
        info!(key = %key, "instance unregistered");
        Ok(())
    }

    async fn get_local(&self) -> Result<Instance, ClusterError> {
        self.local
            .lock()
            .await
            .clone()
            .ok_or(ClusterError::NotRegistered)
    }

    async fn get_all(&self) -> Result<Vec<Instance>, ClusterError> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(
                self.config.cluster_name.as_str(),
                Some(GetOptions::new().with_prefix()),
            )
            .await
            .map_err(map_err)?;

        // etcd returns keys in lexicographic order; preserve it, the shard
        // calculator depends on a fleet-wide consistent ordering.
        let mut instances = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let Ok(key) = kv.key_str() else {
                warn!("skipping non-utf8 key under cluster prefix");
                continue;
            };
            match Instance::from_key(&self.config.cluster_name, key) {
                Some(instance) => instances.push(instance),
                None => debug!(key = %key, "skipping foreign key under cluster prefix"),
            }
        }
        Ok(instances)
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<WatchStream, ClusterError> {
        let prefix = self.config.cluster_name.clone();
        let (mut watcher, mut stream) = self
            .client
            .lock()
            .await
            .watch(prefix.as_str(), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(map_err)?;

        let client = Arc::clone(&self.client);
        let wake_interval = self.config.watch_wake_interval;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(wake_interval);
            ticker.tick().await;
            // Priming event: subscribers reconcile at least once.
            if tx.send(WatchEvent::InstancesChanged).await.is_err() {
                let _ = watcher.cancel().await;
                return;
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = watcher.cancel().await;
                        return;
                    }
                    _ = ticker.tick() => coalesce_send(&tx, WatchEvent::WatchWake),
                    message = stream.message() => {
                        match message {
                            Ok(Some(resp)) => {
                                // Coalesce: at most one event per batch.
                                let changed = resp.events().iter().any(|ev| {
                                    matches!(ev.event_type(), EventType::Put | EventType::Delete)
                                });
                                if changed {
                                    coalesce_send(&tx, WatchEvent::InstancesChanged);
                                }
                            }
                            broken => {
                                let reason = match broken {
                                    Err(e) => e.to_string(),
                                    _ => "watch stream ended".to_string(),
                                };
                                warn!(%reason, "membership watch interrupted, reconnecting");
                                coalesce_send(&tx, WatchEvent::Error(reason));
                                tokio::select! {
                                    _ = cancel.cancelled() => {
                                        let _ = watcher.cancel().await;
                                        return;
                                    }
                                    _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                                }
                                let reconnect = client
                                    .lock()
                                    .await
                                    .watch(prefix.as_str(), Some(WatchOptions::new().with_prefix()))
                                    .await;
                                match reconnect {
                                    Ok((new_watcher, new_stream)) => {
                                        watcher = new_watcher;
                                        stream = new_stream;
                                        // Changes may have been missed while
                                        // disconnected; force a re-read.
                                        coalesce_send(&tx, WatchEvent::InstancesChanged);
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "watch reconnection failed, retrying");
                                        coalesce_send(&tx, WatchEvent::Error(e.to_string()));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

impl Drop for EtcdMembership {
    fn drop(&mut self) {
        if let Some(cancel) = self.hb_cancel.lock().take() {
            cancel.cancel();
        }
    }
}

/// Grant a fresh lease and write the instance key under it. Returns the
/// lease id. The value carries no information; liveness is the key itself.
async fn put_node(
    client: &Arc<Mutex<Client>>,
    key: &str,
    ttl: i64,
) -> Result<i64, ClusterError> {
    let mut client = client.lock().await;
    let lease = client
        .lease_grant(ttl, None::<LeaseGrantOptions>)
        .await
        .map_err(map_err)?;
    if let Err(e) = client
        .put(key, "1", Some(PutOptions::new().with_lease(lease.id())))
        .await
    {
        // Don't leak the just-granted lease; it would linger until TTL.
        if let Err(revoke_err) = client.lease_revoke(lease.id()).await {
            warn!(lease = lease.id(), error = %revoke_err, "failed to revoke orphaned lease");
        }
        return Err(map_err(e));
    }
    Ok(lease.id())
}

/// One keep-alive round-trip, the `KeepAliveOnce` of this backend. A
/// response with a non-positive TTL means the lease is gone server-side.
async fn keep_alive_once(client: &Arc<Mutex<Client>>, lease: i64) -> Result<(), ClusterError> {
    let (mut keeper, mut responses) = client
        .lock()
        .await
        .lease_keep_alive(lease)
        .await
        .map_err(map_err)?;
    keeper.keep_alive().await.map_err(map_err)?;
    match responses.message().await.map_err(map_err)? {
        Some(resp) if resp.ttl() > 0 => Ok(()),
        _ => Err(ClusterError::membership(format!(
            "lease {lease} expired server-side"
        ))),
    }
}

fn map_err(e: etcd_client::Error) -> ClusterError {
    ClusterError::Membership {
        reason: e.to_string(),
        source: Some(Box::new(e)),
    }
}
