use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::assignment::{self, Assignment, MAX_SHARD_NUM};
use crate::error::ClusterError;
use crate::gateway::GatewayProbe;
use crate::instance::Instance;
use crate::membership::{Membership, WatchEvent, WatchStream};
use crate::session::StreamConnector;
use crate::session_manager::SessionManager;
use crate::supervision;

/// Default reconciliation tick interval.
pub const DFT_WATCH_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline for directory reads inside a reconciliation pass.
const DIRECTORY_OP_TIMEOUT: Duration = Duration::from_secs(1);
/// Back-off after a failed pass; the next watch event or tick retries.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Arguments for building a [`Scheduler`].
pub struct SchedulerArgs {
    pub membership: Arc<dyn Membership>,
    pub probe: Arc<dyn GatewayProbe>,
    pub connector: Arc<dyn StreamConnector>,
    pub app_id: u64,
    pub token: String,
    /// Event intent bitmask forwarded to each session's identify.
    pub intent: u32,
    /// Reconciliation tick interval. Each tick re-probes the gateway, so a
    /// changed upstream partition hint is picked up without a membership
    /// event. Default: 60s.
    pub watch_interval: Duration,
    /// Operator floor on the total partition count. The effective total is
    /// `max(watch hint, gateway shards)`.
    pub min_shard_num: u32,
}

impl SchedulerArgs {
    pub fn new(
        membership: Arc<dyn Membership>,
        probe: Arc<dyn GatewayProbe>,
        connector: Arc<dyn StreamConnector>,
        app_id: u64,
        token: impl Into<String>,
        intent: u32,
    ) -> Self {
        Self {
            membership,
            probe,
            connector,
            app_id,
            token: token.into(),
            intent,
            watch_interval: DFT_WATCH_INTERVAL,
            min_shard_num: 0,
        }
    }

    fn validate(&self) -> Result<(), ClusterError> {
        if self.intent == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "intent must not be zero".to_string(),
            });
        }
        if self.app_id == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "app_id must not be zero".to_string(),
            });
        }
        if self.token.is_empty() {
            return Err(ClusterError::InvalidConfig {
                reason: "token must not be empty".to_string(),
            });
        }
        if self.min_shard_num > MAX_SHARD_NUM {
            return Err(ClusterError::InvalidConfig {
                reason: format!(
                    "min_shard_num {} exceeds the {MAX_SHARD_NUM} cap",
                    self.min_shard_num
                ),
            });
        }
        if self.watch_interval.is_zero() {
            return Err(ClusterError::InvalidConfig {
                reason: "watch_interval must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// The reconciler: observes membership and the gateway partition hint,
/// recomputes the local assignment, and swaps session managers when it
/// changes. Construct with [`Scheduler::new`] (the local instance must be
/// registered first), start with [`Scheduler::start`], stop with
/// [`Scheduler::shutdown`].
pub struct Scheduler {
    state: parking_lot::Mutex<Option<ReconcileLoop>>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Validate args and capture the registered local instance. Fails with
    /// `NotRegistered` when `membership.register` has not been called.
    pub async fn new(args: SchedulerArgs) -> Result<Self, ClusterError> {
        args.validate()?;
        let local = args.membership.get_local().await?;
        Ok(Self {
            state: parking_lot::Mutex::new(Some(ReconcileLoop {
                membership: args.membership,
                probe: args.probe,
                connector: args.connector,
                local,
                cancel: CancellationToken::new(),
                app_id: args.app_id,
                token: args.token,
                intent: args.intent,
                watch_interval: args.watch_interval,
                min_shard_num: args.min_shard_num,
                current: None,
                manager: None,
            })),
            cancel: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        })
    }

    /// Subscribe the membership watch and spawn the reconcile task.
    /// Non-blocking; returns an error (and stays startable) when the watch
    /// subscription fails.
    pub async fn start(&self) -> Result<(), ClusterError> {
        let mut state = { self.state.lock().take() }.ok_or(ClusterError::AlreadyStarted)?;
        state.cancel = self.cancel.clone();
        let watch = match state.membership.watch(self.cancel.child_token()).await {
            Ok(watch) => watch,
            Err(e) => {
                *self.state.lock() = Some(state);
                return Err(e);
            }
        };
        let handle = supervision::spawn_supervised("scheduler", state.run(watch));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Token cancelled on shutdown; cancellation cascades to the session
    /// manager and every holder.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the reconcile task and wait for it (and all sessions) to stop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct ManagerHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

struct ReconcileLoop {
    membership: Arc<dyn Membership>,
    probe: Arc<dyn GatewayProbe>,
    connector: Arc<dyn StreamConnector>,
    local: Instance,
    cancel: CancellationToken,
    app_id: u64,
    token: String,
    intent: u32,
    watch_interval: Duration,
    min_shard_num: u32,
    current: Option<Assignment>,
    manager: Option<ManagerHandle>,
}

impl ReconcileLoop {
    async fn run(mut self, mut watch: WatchStream) {
        let mut ticker = tokio::time::interval(self.watch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; the priming watch event already
        // covers the initial pass.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.stop_manager().await;
                    info!("scheduler stopped");
                    return;
                }
                event = watch.next() => match event {
                    Some(event) => {
                        if let WatchEvent::Error(reason) = &event {
                            warn!(%reason, "membership watch reported an error");
                        }
                        self.reconcile().await;
                    }
                    None => {
                        if self.cancel.is_cancelled() {
                            self.stop_manager().await;
                            return;
                        }
                        // The watch contract forbids closing before cancel;
                        // a breach means membership is gone for good.
                        panic!("membership watch closed before shutdown");
                    }
                },
                _ = ticker.tick() => self.reconcile().await,
            }
        }
    }

    /// One reconciliation pass: read members, probe the gateway, compute
    /// the assignment, and reschedule when it changed. Errors abort the
    /// pass; the next event or tick retries.
    async fn reconcile(&mut self) {
        let members =
            match tokio::time::timeout(DIRECTORY_OP_TIMEOUT, self.membership.get_all()).await {
                Ok(Ok(members)) => members,
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to list instances, retrying on next tick");
                    tokio::time::sleep(RETRY_DELAY).await;
                    return;
                }
                Err(_) => {
                    warn!("instance listing timed out, retrying on next tick");
                    tokio::time::sleep(RETRY_DELAY).await;
                    return;
                }
            };

        let next = match assignment::locate_self(&members, &self.local.id) {
            None => None,
            Some((self_idx, valid_count)) => {
                let ap = match self.probe.probe().await {
                    Ok(ap) => ap,
                    Err(e) => {
                        warn!(error = %e, "gateway probe failed, keeping current assignment");
                        tokio::time::sleep(RETRY_DELAY).await;
                        return;
                    }
                };
                match assignment::assign_shards(self_idx, valid_count, self.min_shard_num, ap) {
                    Ok(assignment) => Some(assignment),
                    Err(e) => {
                        warn!(error = %e, "assignment rejected, keeping current assignment");
                        tokio::time::sleep(RETRY_DELAY).await;
                        return;
                    }
                }
            }
        };

        if same_assignment(&self.current, &next) {
            return;
        }

        let old = describe(&self.current);
        let new = describe(&next);
        info!(%old, %new, "assignment changed, rescheduling");

        // Stop-then-start: the gateway enforces one session per identity
        // and partition, so the old epoch must fully exit first.
        self.stop_manager().await;
        if let Some(assignment) = &next {
            if assignment.shard_ids.is_empty() {
                info!(shard_num = assignment.shard_num, "no shards owned, idling");
            } else {
                self.start_manager(assignment.clone());
            }
        }
        self.current = next;
    }

    fn start_manager(&mut self, assignment: Assignment) {
        let cancel = self.cancel.child_token();
        let manager = SessionManager::new(
            cancel.clone(),
            Arc::clone(&self.connector),
            assignment,
            self.app_id,
            self.token.clone(),
            self.intent,
        );
        let task = supervision::spawn_supervised("session-manager", manager.run());
        self.manager = Some(ManagerHandle { cancel, task });
    }

    async fn stop_manager(&mut self) {
        if let Some(handle) = self.manager.take() {
            handle.cancel.cancel();
            if handle.task.await.is_err() {
                error!("session manager task failed to join");
            }
        }
    }
}

fn same_assignment(current: &Option<Assignment>, next: &Option<Assignment>) -> bool {
    match (current, next) {
        (None, None) => true,
        (Some(a), Some(b)) => a.is_equivalent(b),
        _ => false,
    }
}

fn describe(assignment: &Option<Assignment>) -> String {
    assignment
        .as_ref()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayInfo, SessionStartLimit};
    use crate::storage::memory::MemoryMembership;
    use crate::testing::{ScriptedConnector, StaticProbe};

    fn ap(shards: u32) -> GatewayInfo {
        GatewayInfo {
            url: "wss://gateway.example.com".to_string(),
            shards,
            session_start_limit: SessionStartLimit { max_concurrency: 5 },
        }
    }

    fn args(membership: Arc<MemoryMembership>) -> SchedulerArgs {
        SchedulerArgs::new(
            membership,
            Arc::new(StaticProbe::new(ap(1))),
            ScriptedConnector::new(),
            12345,
            "token",
            1 << 30,
        )
    }

    #[tokio::test]
    async fn new_requires_registration() {
        let membership = Arc::new(MemoryMembership::new());
        let err = Scheduler::new(args(membership)).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotRegistered));
    }

    #[tokio::test]
    async fn new_validates_args() {
        let membership = Arc::new(MemoryMembership::new());
        membership.register(Some("10.0.0.1")).await.unwrap();

        let mut a = args(Arc::clone(&membership));
        a.intent = 0;
        assert!(Scheduler::new(a).await.is_err());

        let mut a = args(Arc::clone(&membership));
        a.app_id = 0;
        assert!(Scheduler::new(a).await.is_err());

        let mut a = args(Arc::clone(&membership));
        a.token = String::new();
        assert!(Scheduler::new(a).await.is_err());

        let mut a = args(Arc::clone(&membership));
        a.min_shard_num = MAX_SHARD_NUM + 1;
        assert!(Scheduler::new(a).await.is_err());

        let a = args(membership);
        Scheduler::new(a).await.unwrap();
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let membership = Arc::new(MemoryMembership::new());
        membership.register(Some("10.0.0.1")).await.unwrap();
        let sched = Scheduler::new(args(membership)).await.unwrap();
        sched.start().await.unwrap();
        assert!(matches!(
            sched.start().await.unwrap_err(),
            ClusterError::AlreadyStarted
        ));
        sched.shutdown().await;
    }

    #[test]
    fn assignment_comparison() {
        let a = Assignment {
            shard_ids: [1, 4].into_iter().collect(),
            shard_num: 5,
            ap: ap(5),
        };
        assert!(same_assignment(&None, &None));
        assert!(same_assignment(&Some(a.clone()), &Some(a.clone())));
        assert!(!same_assignment(&None, &Some(a.clone())));
        assert!(!same_assignment(&Some(a), &None));
    }
}
