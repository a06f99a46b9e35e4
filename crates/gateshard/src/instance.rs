use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// A member of the cluster, identified by a cluster-unique id.
///
/// Two instances are the same instance iff their ids are equal. Lease
/// handles and other backend-specific lifetime state stay inside the
/// backend that created the instance.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
}

impl Instance {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// An instance is valid iff its id is non-empty.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
    }

    /// Full directory key for this instance: `{cluster_name}_{id}`.
    pub fn key(&self, cluster_name: &str) -> String {
        format!("{cluster_name}_{}", self.id)
    }

    /// Parse an instance back out of a directory key. Returns `None` for
    /// keys that do not belong to `cluster_name` or carry an empty id.
    pub fn from_key(cluster_name: &str, key: &str) -> Option<Self> {
        let id = key
            .strip_prefix(cluster_name)
            .and_then(|rest| rest.strip_prefix('_'))?;
        if id.is_empty() {
            return None;
        }
        Some(Self::new(id))
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Hash for Instance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Best-effort local host IP, used only when no explicit instance id is
/// configured. Resolves the outbound interface address by connecting a UDP
/// socket (no packets are sent).
pub(crate) fn local_host_ip() -> Result<String, ClusterError> {
    let socket =
        std::net::UdpSocket::bind("0.0.0.0:0").map_err(|e| ClusterError::Membership {
            reason: format!("failed to bind probe socket: {e}"),
            source: Some(Box::new(e)),
        })?;
    socket
        .connect("10.254.254.254:1")
        .map_err(|e| ClusterError::Membership {
            reason: format!("failed to resolve local host ip: {e}"),
            source: Some(Box::new(e)),
        })?;
    let addr = socket.local_addr().map_err(|e| ClusterError::Membership {
        reason: format!("failed to read local address: {e}"),
        source: Some(Box::new(e)),
    })?;
    Ok(addr.ip().to_string())
}
