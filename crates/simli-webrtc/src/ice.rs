//! ICE relay/STUN server discovery with bounded retry and fallback

use crate::config::RetryPolicy;
use crate::health::HTTP_REQUEST_TIMEOUT;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Public STUN server used when relay discovery is exhausted
pub const FALLBACK_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// One ICE relay/STUN/TURN endpoint, as returned by the vendor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (stun:, turn:, turns:)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// The fallback STUN-only entry
    pub fn fallback() -> Self {
        Self {
            urls: vec![FALLBACK_STUN_URL.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Fetches the vendor's ICE server list, degrading instead of failing
///
/// Discovery failures never surface to the caller: after `max_attempts`
/// the resolver returns the hardcoded public STUN server so a connection
/// attempt is always possible.
pub struct IceServerResolver {
    base_url: String,
    policy: RetryPolicy,
    http: reqwest::Client,
}

impl IceServerResolver {
    /// Create a resolver against a vendor base URL
    pub fn new(base_url: impl Into<String>, policy: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::IceDiscovery(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into(),
            policy,
            http,
        })
    }

    /// Resolve the ICE server list for one connection attempt
    pub async fn resolve(&self) -> Vec<IceServer> {
        for attempt in 1..=self.policy.max_attempts {
            match self.fetch().await {
                Ok(servers) if !servers.is_empty() => {
                    info!(count = servers.len(), "resolved ICE servers");
                    return servers;
                }
                Ok(_) => warn!(attempt, "ICE server response was empty"),
                Err(e) => warn!(attempt, error = %e, "ICE server fetch failed"),
            }

            if self.policy.should_retry(attempt) {
                tokio::time::sleep(self.policy.delay()).await;
            }
        }

        info!("using fallback STUN server");
        vec![IceServer::fallback()]
    }

    async fn fetch(&self) -> Result<Vec<IceServer>> {
        let url = format!("{}/getIceServers", self.base_url);

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| Error::IceDiscovery(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::IceDiscovery(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        response
            .json::<Vec<IceServer>>()
            .await
            .map_err(|e| Error::IceDiscovery(format!("malformed server list: {}", e)))
    }
}
