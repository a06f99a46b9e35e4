use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::DFT_WATCH_WAKE_INTERVAL;
use crate::error::ClusterError;
use crate::instance::{local_host_ip, Instance};
use crate::membership::{coalesce_send, Membership, WatchEvent, WatchStream, WATCH_CHANNEL_CAPACITY};

#[derive(Debug, Deserialize)]
struct ConfigFile {
    instance_list: Vec<Instance>,
}

/// File-backed membership: a fixed instance list loaded from YAML.
///
/// Registration succeeds only for ids present in the file; keeping the
/// listed ids unique is the operator's responsibility. The directory never
/// changes at runtime, so watch channels carry only the priming event and
/// periodic wakes.
///
/// ```yaml
/// instance_list:
///   - id: 10.0.0.1
///   - id: 10.0.0.2
/// ```
pub struct StaticMembership {
    instances: Vec<Instance>,
    wake_interval: Duration,
    local: Mutex<Option<Instance>>,
}

impl StaticMembership {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| ClusterError::Membership {
            reason: format!("failed to read {}: {e}", path.as_ref().display()),
            source: Some(Box::new(e)),
        })?;
        let config: ConfigFile =
            serde_yaml::from_str(&raw).map_err(|e| ClusterError::Membership {
                reason: format!("malformed instance list in {}: {e}", path.as_ref().display()),
                source: Some(Box::new(e)),
            })?;
        Self::from_instances(config.instance_list)
    }

    pub fn from_instances(instances: Vec<Instance>) -> Result<Self, ClusterError> {
        if instances.is_empty() {
            return Err(ClusterError::InvalidConfig {
                reason: "instance list must not be empty".to_string(),
            });
        }
        Ok(Self {
            instances,
            wake_interval: DFT_WATCH_WAKE_INTERVAL,
            local: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Membership for StaticMembership {
    async fn register(&self, id: Option<&str>) -> Result<Instance, ClusterError> {
        if let Some(local) = self.local.lock().as_ref() {
            return Ok(local.clone());
        }
        let id = match id.filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => local_host_ip()?,
        };
        let instance = self
            .instances
            .iter()
            .find(|ins| ins.id == id)
            .cloned()
            .ok_or_else(|| ClusterError::Membership {
                reason: format!("instance {id} is not in the configured list"),
                source: None,
            })?;
        *self.local.lock() = Some(instance.clone());
        Ok(instance)
    }

    async fn unregister(&self) -> Result<(), ClusterError> {
        *self.local.lock() = None;
        Ok(())
    }

    async fn get_local(&self) -> Result<Instance, ClusterError> {
        self.local.lock().clone().ok_or(ClusterError::NotRegistered)
    }

    async fn get_all(&self) -> Result<Vec<Instance>, ClusterError> {
        Ok(self.instances.clone())
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<WatchStream, ClusterError> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let wake_interval = self.wake_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(wake_interval);
            ticker.tick().await;
            if tx.send(WatchEvent::InstancesChanged).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => coalesce_send(&tx, WatchEvent::WatchWake),
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
