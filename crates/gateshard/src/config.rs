use std::time::Duration;

use crate::error::ClusterError;

/// Default per-operation timeout for the membership backend.
pub const DFT_ETCD_TIMEOUT: Duration = Duration::from_secs(1);
/// Default heartbeat interval.
pub const DFT_HB_INTERVAL: Duration = Duration::from_secs(3);
/// Default heartbeat timeout factor. An instance whose lease is not renewed
/// within `hb_interval * hb_timeout_factor` is removed from the directory.
pub const DFT_HB_TIMEOUT_FACTOR: u64 = 3;
/// Default interval between `WatchWake` events on a watch channel.
pub const DFT_WATCH_WAKE_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for a lease-backed membership directory.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Name of the cluster. Directory keys are `{cluster_name}_{instance_id}`.
    pub cluster_name: String,
    /// Backend endpoints (e.g. etcd addresses).
    pub endpoints: Vec<String>,
    /// Per-operation timeout for backend RPCs. Default: 1s.
    pub etcd_timeout: Duration,
    /// Heartbeat interval. Default: 3s.
    pub hb_interval: Duration,
    /// Lease TTL factor: TTL = `hb_interval * hb_timeout_factor`. Default: 3.
    pub hb_timeout_factor: u64,
    /// Interval between `WatchWake` events. Default: 60s.
    pub watch_wake_interval: Duration,
}

impl ClusterConfig {
    /// Create a configuration with defaults for all optional fields.
    pub fn new(cluster_name: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            endpoints,
            etcd_timeout: DFT_ETCD_TIMEOUT,
            hb_interval: DFT_HB_INTERVAL,
            hb_timeout_factor: DFT_HB_TIMEOUT_FACTOR,
            watch_wake_interval: DFT_WATCH_WAKE_INTERVAL,
        }
    }

    /// Lease TTL in whole seconds.
    pub fn lease_ttl_secs(&self) -> i64 {
        self.hb_interval.as_secs() as i64 * self.hb_timeout_factor as i64
    }

    /// Validate configuration values.
    ///
    /// Checks:
    /// - non-empty cluster name and endpoint list
    /// - all durations >= 1s
    /// - `hb_timeout_factor >= 3` (smaller factors make a single missed
    ///   heartbeat fatal)
    /// - `watch_wake_interval >= hb_interval`
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.cluster_name.is_empty() {
            return Err(ClusterError::InvalidConfig {
                reason: "cluster_name must not be empty".to_string(),
            });
        }
        if self.endpoints.is_empty() {
            return Err(ClusterError::InvalidConfig {
                reason: "endpoints must not be empty".to_string(),
            });
        }
        if self.etcd_timeout < Duration::from_secs(1) {
            return Err(ClusterError::InvalidConfig {
                reason: format!("etcd_timeout must be >= 1s, got {:?}", self.etcd_timeout),
            });
        }
        if self.hb_interval < Duration::from_secs(1) {
            return Err(ClusterError::InvalidConfig {
                reason: format!("hb_interval must be >= 1s, got {:?}", self.hb_interval),
            });
        }
        if self.hb_timeout_factor < DFT_HB_TIMEOUT_FACTOR {
            return Err(ClusterError::InvalidConfig {
                reason: format!(
                    "hb_timeout_factor must be >= {DFT_HB_TIMEOUT_FACTOR}, got {}",
                    self.hb_timeout_factor
                ),
            });
        }
        if self.watch_wake_interval < self.hb_interval {
            return Err(ClusterError::InvalidConfig {
                reason: format!(
                    "watch_wake_interval must be >= hb_interval, got {:?} < {:?}",
                    self.watch_wake_interval, self.hb_interval
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        ClusterConfig::new("bots", vec!["127.0.0.1:2379".to_string()])
    }

    #[test]
    fn default_values() {
        let config = config();
        assert_eq!(config.etcd_timeout, Duration::from_secs(1));
        assert_eq!(config.hb_interval, Duration::from_secs(3));
        assert_eq!(config.hb_timeout_factor, 3);
        assert_eq!(config.watch_wake_interval, Duration::from_secs(60));
    }

    #[test]
    fn default_config_is_valid() {
        config().validate().unwrap();
    }

    #[test]
    fn lease_ttl_is_interval_times_factor() {
        assert_eq!(config().lease_ttl_secs(), 9);

        let custom = ClusterConfig {
            hb_interval: Duration::from_secs(5),
            hb_timeout_factor: 4,
            ..config()
        };
        assert_eq!(custom.lease_ttl_secs(), 20);
    }

    #[test]
    fn validate_empty_cluster_name() {
        let cfg = ClusterConfig::new("", vec!["127.0.0.1:2379".to_string()]);
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("cluster_name"), "got: {msg}");
    }

    #[test]
    fn validate_empty_endpoints() {
        let cfg = ClusterConfig::new("bots", Vec::new());
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("endpoints"), "got: {msg}");
    }

    #[test]
    fn validate_sub_second_durations() {
        let cfg = ClusterConfig {
            hb_interval: Duration::from_millis(500),
            ..config()
        };
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("hb_interval"), "got: {msg}");

        let cfg = ClusterConfig {
            etcd_timeout: Duration::from_millis(100),
            ..config()
        };
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("etcd_timeout"), "got: {msg}");
    }

    #[test]
    fn validate_timeout_factor_floor() {
        let cfg = ClusterConfig {
            hb_timeout_factor: 2,
            ..config()
        };
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("hb_timeout_factor"), "got: {msg}");
    }

    #[test]
    fn validate_wake_interval_below_heartbeat() {
        let cfg = ClusterConfig {
            watch_wake_interval: Duration::from_secs(1),
            ..config()
        };
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("watch_wake_interval"), "got: {msg}");
    }
}
