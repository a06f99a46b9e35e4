use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ClusterError;
use crate::instance::Instance;

/// An event observed on a membership watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The set of registered instances changed (or may have changed; the
    /// subscriber is expected to re-read the directory).
    InstancesChanged,
    /// Periodic wake-up so subscribers can reconcile even when the directory
    /// is quiet (e.g. the upstream partition hint changed).
    WatchWake,
    /// A transient backend error. The channel stays open.
    Error(String),
}

/// Stream of watch events. Closes only when the subscription's cancellation
/// token fires.
pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// Capacity of the bounded watch channel. Events are coalesced rather than
/// queued: a full buffer drops the new event, because a pending
/// `InstancesChanged` already forces the subscriber to re-read state.
pub(crate) const WATCH_CHANNEL_CAPACITY: usize = 8;

/// Send a watch event without ever blocking the forwarder. A full channel
/// means an equivalent wake-up is already pending, so the event is dropped.
pub(crate) fn coalesce_send(tx: &mpsc::Sender<WatchEvent>, event: WatchEvent) {
    use mpsc::error::TrySendError;
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(ev)) => {
            tracing::debug!(event = ?ev, "watch channel full, coalescing");
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

/// A distributed directory of live cluster instances.
///
/// Implementations back this with a lease-based KV (`storage::etcd`), a
/// static file (`storage::static_file`), or process memory
/// (`storage::memory`).
#[async_trait]
pub trait Membership: Send + Sync {
    /// Register the local instance. With `None`, the backend derives an id
    /// (host IP). Starts the background heartbeat and returns once the
    /// initial registration is acknowledged. Idempotent: a second call
    /// returns the already-registered instance.
    async fn register(&self, id: Option<&str>) -> Result<Instance, ClusterError>;

    /// Unregister the local instance: stop the heartbeat, delete the
    /// directory key, revoke the lease. Safe to call when unregistered.
    async fn unregister(&self) -> Result<(), ClusterError>;

    /// The locally registered instance, or `NotRegistered`.
    async fn get_local(&self) -> Result<Instance, ClusterError>;

    /// Best-effort snapshot of all registered instances, in lexicographic
    /// key order. Callers rely on this ordering for deterministic shard
    /// assignment across the fleet.
    async fn get_all(&self) -> Result<Vec<Instance>, ClusterError>;

    /// Subscribe to directory changes. The returned stream:
    /// - yields exactly one priming `InstancesChanged` immediately,
    /// - coalesces backend put/delete batches into single events,
    /// - yields `WatchWake` on the configured wake interval,
    /// - yields `Error` (and stays open) on transient backend failure,
    /// - ends only when `cancel` fires.
    async fn watch(&self, cancel: CancellationToken) -> Result<WatchStream, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        coalesce_send(&tx, WatchEvent::InstancesChanged);
        coalesce_send(&tx, WatchEvent::InstancesChanged);
        coalesce_send(&tx, WatchEvent::WatchWake);

        assert_eq!(rx.try_recv().unwrap(), WatchEvent::InstancesChanged);
        assert!(rx.try_recv().is_err(), "extra events should be coalesced");
    }

    #[test]
    fn coalesce_ignores_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        // Must not panic.
        coalesce_send(&tx, WatchEvent::WatchWake);
    }
}
