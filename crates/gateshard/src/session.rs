use std::sync::Arc;

use async_trait::async_trait;

/// Close code for a connection the gateway terminated outright.
pub const CODE_CONN_CLOSED: i32 = 4009;
/// Close code for a session the gateway no longer recognizes.
pub const CODE_INVALID_SESSION: i32 = 4024;

/// An error surfaced by a stream session, carrying the gateway's close code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("session error {code}: {reason}")]
pub struct SessionError {
    pub code: i32,
    pub reason: String,
}

impl SessionError {
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Whether the session identity must be discarded. Errors outside the
    /// non-resumable set keep the session id and sequence for a resume.
    pub fn can_not_resume(&self) -> bool {
        matches!(self.code, CODE_CONN_CLOSED | CODE_INVALID_SESSION)
    }
}

/// Everything needed to (re)establish one partition's streaming session.
///
/// `session_id` is empty until the first successful identify; `last_seq` is
/// the monotonic upstream sequence used to resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub url: String,
    pub app_id: u64,
    pub token: String,
    pub intent: u32,
    pub shard_id: u32,
    pub shard_count: u32,
    pub session_id: String,
    pub last_seq: u64,
}

/// A single long-lived streaming session to the gateway.
///
/// The holder drives the lifecycle: `connect`, then `identify` (fresh) or
/// `resume` (continuing), then `listening` until the stream ends. `close`
/// must promptly unblock a concurrent `listening` call.
#[async_trait]
pub trait StreamSession: Send + Sync {
    async fn connect(&self) -> Result<(), SessionError>;
    async fn identify(&self) -> Result<(), SessionError>;
    async fn resume(&self) -> Result<(), SessionError>;
    /// Blocks until the stream ends. `Ok` means a clean end (e.g. `close`).
    async fn listening(&self) -> Result<(), SessionError>;
    fn close(&self);
    /// Snapshot of the session identity, including any `session_id` and
    /// `last_seq` the stream picked up while listening.
    fn session(&self) -> SessionState;
}

/// Builds a fresh [`StreamSession`] per connection attempt.
pub trait StreamConnector: Send + Sync {
    fn new_session(&self, state: SessionState) -> Arc<dyn StreamSession>;
}
