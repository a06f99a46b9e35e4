use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Deadline for a single gateway probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Session start budget advertised by the gateway: `max_concurrency`
/// sessions may be started per 5-second window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub max_concurrency: u32,
}

/// Gateway access-point info. `shards` is the minimum partition count the
/// gateway will accept for this identity; it may change over time, so
/// callers re-probe on every reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// One-shot probe of the gateway access point.
#[async_trait]
pub trait GatewayProbe: Send + Sync {
    async fn probe(&self) -> Result<GatewayInfo, ClusterError>;
}

/// HTTP gateway probe with a 3-second deadline.
pub struct HttpGatewayProbe {
    http: reqwest::Client,
    gateway_url: String,
    authorization: String,
}

impl HttpGatewayProbe {
    pub fn new(
        gateway_url: impl Into<String>,
        app_id: u64,
        token: &str,
    ) -> Result<Self, ClusterError> {
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| ClusterError::Probe {
                reason: format!("failed to build http client: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self {
            http,
            gateway_url: gateway_url.into(),
            authorization: format!("Bot {app_id}.{token}"),
        })
    }
}

#[async_trait]
impl GatewayProbe for HttpGatewayProbe {
    async fn probe(&self) -> Result<GatewayInfo, ClusterError> {
        let resp = self
            .http
            .get(&self.gateway_url)
            .header(reqwest::header::AUTHORIZATION, self.authorization.as_str())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ClusterError::Probe {
                reason: format!("gateway request failed: {e}"),
                source: Some(Box::new(e)),
            })?;
        let info: GatewayInfo = resp.json().await.map_err(|e| ClusterError::Probe {
            reason: format!("malformed gateway response: {e}"),
            source: Some(Box::new(e)),
        })?;
        if info.url.is_empty() {
            return Err(ClusterError::Probe {
                reason: "gateway returned an empty session url".to_string(),
                source: None,
            });
        }
        tracing::debug!(
            url = %info.url,
            shards = info.shards,
            max_concurrency = info.session_start_limit.max_concurrency,
            "gateway probe"
        );
        Ok(info)
    }
}
