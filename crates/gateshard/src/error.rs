/// Errors that can occur in the sharding coordinator.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("no local instance registered")]
    NotRegistered,

    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("membership error: {reason}")]
    Membership {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("gateway probe error: {reason}")]
    Probe {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("assignment error: {reason}")]
    Assignment { reason: String },

    #[error("cluster is shutting down")]
    ShuttingDown,
}

impl ClusterError {
    /// Shorthand for a membership error without an underlying source.
    pub fn membership(reason: impl Into<String>) -> Self {
        ClusterError::Membership {
            reason: reason.into(),
            source: None,
        }
    }
}
