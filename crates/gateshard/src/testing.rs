//! Scripted fakes for the gateway probe and the stream session capability.
//!
//! Used by this crate's unit and integration tests; also handy for testing
//! application code built on the scheduler without a real gateway.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::ClusterError;
use crate::gateway::{GatewayInfo, GatewayProbe};
use crate::session::{SessionError, SessionState, StreamConnector, StreamSession};

/// A probe that serves a mutable, in-memory [`GatewayInfo`].
pub struct StaticProbe {
    info: Mutex<GatewayInfo>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl StaticProbe {
    pub fn new(info: GatewayInfo) -> Self {
        Self {
            info: Mutex::new(info),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Replace the served info; the next probe observes the change.
    pub fn set(&self, info: GatewayInfo) {
        *self.info.lock() = info;
    }

    /// Make every probe fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayProbe for StaticProbe {
    async fn probe(&self) -> Result<GatewayInfo, ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClusterError::Probe {
                reason: "scripted probe failure".to_string(),
                source: None,
            });
        }
        Ok(self.info.lock().clone())
    }
}

/// Scripted behavior for one session attempt on a shard.
#[derive(Debug, Clone)]
pub enum SessionScript {
    /// `connect` fails.
    ConnectError(SessionError),
    /// `connect` succeeds, `identify`/`resume` fails.
    AuthError(SessionError),
    /// The attempt reaches `listening`, which ends with this result.
    Listen(Result<(), SessionError>),
    /// `listening` blocks until `close`.
    Hold,
}

/// What a scripted session observed, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connect,
    ConnectFailed,
    Identify,
    Resume { session_id: String },
    Listening,
    Closed,
}

/// One recorded call with its shard and timestamp.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub shard_id: u32,
    pub event: SessionEvent,
    pub at: Instant,
}

/// Connector that hands out [`ScriptedSession`]s, consuming one
/// [`SessionScript`] per attempt from the shard's queue (default: `Hold`).
pub struct ScriptedConnector {
    scripts: Mutex<HashMap<u32, VecDeque<SessionScript>>>,
    events: Arc<Mutex<Vec<RecordedEvent>>>,
    session_counter: AtomicUsize,
    sessions_created: AtomicUsize,
}

impl ScriptedConnector {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            events: Arc::new(Mutex::new(Vec::new())),
            session_counter: AtomicUsize::new(0),
            sessions_created: AtomicUsize::new(0),
        })
    }

    /// Queue scripts for successive attempts on `shard_id`.
    pub fn script(&self, shard_id: u32, scripts: Vec<SessionScript>) {
        self.scripts
            .lock()
            .entry(shard_id)
            .or_default()
            .extend(scripts);
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Event kinds recorded for one shard, in order.
    pub fn events_for(&self, shard_id: u32) -> Vec<SessionEvent> {
        self.events
            .lock()
            .iter()
            .filter(|ev| ev.shard_id == shard_id)
            .map(|ev| ev.event.clone())
            .collect()
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }
}

impl StreamConnector for ScriptedConnector {
    fn new_session(&self, state: SessionState) -> Arc<dyn StreamSession> {
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .get_mut(&state.shard_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(SessionScript::Hold);
        Arc::new(ScriptedSession {
            state: Mutex::new(state),
            script,
            closed: CancellationToken::new(),
            events: Arc::clone(&self.events),
            counter: format!("sess-{}", self.session_counter.fetch_add(1, Ordering::SeqCst)),
        })
    }
}

/// A fake stream session driven by a [`SessionScript`].
pub struct ScriptedSession {
    state: Mutex<SessionState>,
    script: SessionScript,
    closed: CancellationToken,
    events: Arc<Mutex<Vec<RecordedEvent>>>,
    counter: String,
}

impl ScriptedSession {
    fn record(&self, event: SessionEvent) {
        let shard_id = self.state.lock().shard_id;
        self.events.lock().push(RecordedEvent {
            shard_id,
            event,
            at: Instant::now(),
        });
    }
}

#[async_trait]
impl StreamSession for ScriptedSession {
    async fn connect(&self) -> Result<(), SessionError> {
        if let SessionScript::ConnectError(err) = &self.script {
            self.record(SessionEvent::ConnectFailed);
            return Err(err.clone());
        }
        self.record(SessionEvent::Connect);
        Ok(())
    }

    async fn identify(&self) -> Result<(), SessionError> {
        if let SessionScript::AuthError(err) = &self.script {
            return Err(err.clone());
        }
        self.record(SessionEvent::Identify);
        let mut state = self.state.lock();
        state.session_id = self.counter.clone();
        state.last_seq = 0;
        Ok(())
    }

    async fn resume(&self) -> Result<(), SessionError> {
        if let SessionScript::AuthError(err) = &self.script {
            return Err(err.clone());
        }
        let session_id = self.state.lock().session_id.clone();
        self.record(SessionEvent::Resume { session_id });
        Ok(())
    }

    async fn listening(&self) -> Result<(), SessionError> {
        self.record(SessionEvent::Listening);
        match &self.script {
            SessionScript::Hold => {
                self.closed.cancelled().await;
                Ok(())
            }
            SessionScript::Listen(result) => {
                // Pretend some events were consumed before the stream ended.
                self.state.lock().last_seq += 10;
                result.clone()
            }
            // connect/auth already failed; listening is never reached.
            _ => Ok(()),
        }
    }

    fn close(&self) {
        self.record(SessionEvent::Closed);
        self.closed.cancel();
    }

    fn session(&self) -> SessionState {
        self.state.lock().clone()
    }
}
