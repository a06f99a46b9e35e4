use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assignment::Assignment;
use crate::session::{SessionState, StreamConnector, StreamSession};
use crate::supervision;

/// Delay before (re)starting a holder pulled from the restart queue.
pub(crate) const HOLDER_RESTART_DELAY: Duration = Duration::from_millis(100);

/// Per-session start interval derived from the gateway's "N per 5 s"
/// budget, rounded half away from zero.
pub fn start_interval(max_concurrency: u32) -> Duration {
    let per_window = max_concurrency.max(1);
    Duration::from_secs((5.0 / f64::from(per_window)).round() as u64)
}

/// Supervises one streaming session per owned partition.
///
/// Initial starts and reconnects both flow through a single restart queue,
/// so the gateway's session start budget applies uniformly. Cancelling the
/// manager's token stops every holder exactly once and waits for their
/// supervising tasks to exit.
pub struct SessionManager {
    cancel: CancellationToken,
    connector: Arc<dyn StreamConnector>,
    assignment: Assignment,
    app_id: u64,
    token: String,
    intent: u32,
}

impl SessionManager {
    pub fn new(
        cancel: CancellationToken,
        connector: Arc<dyn StreamConnector>,
        assignment: Assignment,
        app_id: u64,
        token: String,
        intent: u32,
    ) -> Self {
        Self {
            cancel,
            connector,
            assignment,
            app_id,
            token,
            intent,
        }
    }

    pub async fn run(self) {
        let interval = start_interval(self.assignment.ap.session_start_limit.max_concurrency);
        let shard_ids: Vec<u32> = self.assignment.shard_ids.iter().copied().collect();
        info!(
            sessions = shard_ids.len(),
            shard_num = self.assignment.shard_num,
            interval_secs = interval.as_secs(),
            "starting session pool"
        );

        let (restart_tx, mut restart_rx) = mpsc::channel(shard_ids.len().max(1));
        let mut holders = Vec::with_capacity(shard_ids.len());
        for shard_id in shard_ids {
            let state = SessionState {
                url: self.assignment.ap.url.clone(),
                app_id: self.app_id,
                token: self.token.clone(),
                intent: self.intent,
                shard_id,
                shard_count: self.assignment.shard_num,
                session_id: String::new(),
                last_seq: 0,
            };
            let holder = Arc::new(SessionHolder::new(
                state,
                Arc::clone(&self.connector),
                restart_tx.clone(),
            ));
            // Queue capacity equals the holder count, so this cannot fail.
            let _ = restart_tx.try_send(Arc::clone(&holder));
            holders.push(holder);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    for holder in &holders {
                        holder.stop();
                    }
                    for holder in &holders {
                        holder.join().await;
                    }
                    info!("session pool stopped");
                    return;
                }
                Some(holder) = restart_rx.recv() => {
                    tokio::time::sleep(HOLDER_RESTART_DELAY).await;
                    holder.start();
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}

/// One partition's connection supervisor.
///
/// Owned exclusively by the [`SessionManager`] that created it. The
/// supervising task re-enqueues the holder on the restart queue after every
/// stream end until `stop` is called.
pub(crate) struct SessionHolder {
    state: parking_lot::Mutex<SessionState>,
    stopped: AtomicBool,
    stream: parking_lot::Mutex<Option<Arc<dyn StreamSession>>>,
    connector: Arc<dyn StreamConnector>,
    restart_tx: mpsc::Sender<Arc<SessionHolder>>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionHolder {
    fn new(
        state: SessionState,
        connector: Arc<dyn StreamConnector>,
        restart_tx: mpsc::Sender<Arc<SessionHolder>>,
    ) -> Self {
        Self {
            state: parking_lot::Mutex::new(state),
            stopped: AtomicBool::new(false),
            stream: parking_lot::Mutex::new(None),
            connector,
            restart_tx,
            task: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn start(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let session = self.connector.new_session(self.state.lock().clone());
        *self.stream.lock() = Some(Arc::clone(&session));

        let holder = Arc::clone(self);
        let handle = supervision::spawn_supervised("session-holder", async move {
            let shard_id = holder.state.lock().shard_id;
            holder.connect_and_listen(&session).await;
            if holder.stopped.load(Ordering::SeqCst) {
                info!(shard_id, "session holder exiting");
                return;
            }
            info!(shard_id, "session ended, scheduling reconnect");
            tokio::time::sleep(HOLDER_RESTART_DELAY).await;
            let _ = holder.restart_tx.send(Arc::clone(&holder)).await;
        });
        *self.task.lock() = Some(handle);
    }

    async fn connect_and_listen(&self, session: &Arc<dyn StreamSession>) {
        let (shard_id, resuming) = {
            let state = self.state.lock();
            (state.shard_id, !state.session_id.is_empty())
        };
        if let Err(e) = session.connect().await {
            warn!(shard_id, error = %e, "connect failed");
            return;
        }
        let auth = if resuming {
            session.resume().await
        } else {
            session.identify().await
        };
        if let Err(e) = auth {
            warn!(shard_id, resumed = resuming, error = %e, "identify/resume failed");
            return;
        }
        info!(shard_id, resumed = resuming, "session established");

        let result = session.listening().await;
        let mut snapshot = session.session();
        if let Err(e) = result {
            warn!(shard_id, code = e.code, error = %e, "listening ended");
            if e.can_not_resume() {
                // Next attempt starts a fresh identify.
                snapshot.session_id.clear();
                snapshot.last_seq = 0;
            }
        }
        let mut state = self.state.lock();
        state.session_id = snapshot.session_id;
        state.last_seq = snapshot.last_seq;
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(stream) = self.stream.lock().as_ref() {
            stream.close();
        }
    }

    /// Wait for the supervising task (if any) to exit. Called after `stop`.
    pub(crate) async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
