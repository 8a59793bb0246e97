//! Session token acquisition
//!
//! One HTTP exchange trades session metadata for the opaque token that
//! authorizes an avatar-rendering session. There is no internal retry:
//! the orchestrator's outer attempt loop owns retries.

use crate::config::SimliClientConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Wire body for `POST /startAudioToVideoSession`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
    #[serde(rename = "isJPG")]
    is_jpg: bool,
    sync_audio: bool,
    handle_silence: bool,
    max_session_length: u64,
    max_idle_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_token: String,
}

/// Exchanges session metadata for a session token
pub struct SessionTokenProvider {
    base_url: String,
    http: reqwest::Client,
    avatar_id: Option<String>,
    api_key: Option<String>,
    handle_silence: bool,
    max_session_length: u64,
    max_idle_time: u64,
    model: Option<String>,
    cached: Option<String>,
}

impl SessionTokenProvider {
    /// Create a provider from the client configuration
    ///
    /// A config-supplied token is cached and reused for every attempt;
    /// otherwise one HTTP exchange is issued per [`acquire`] call.
    ///
    /// [`acquire`]: SessionTokenProvider::acquire
    pub fn new(config: &SimliClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(crate::health::HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::SessionInit(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.api_base_url.clone(),
            http,
            avatar_id: config.avatar_id.clone(),
            api_key: config.api_key.clone(),
            handle_silence: config.handle_silence,
            max_session_length: config.max_session_length,
            max_idle_time: config.max_idle_time,
            model: config.model.clone(),
            cached: config.session_token.clone(),
        })
    }

    /// Acquire a session token
    pub async fn acquire(&self) -> Result<String> {
        if let Some(token) = &self.cached {
            debug!("reusing configured session token");
            return Ok(token.clone());
        }

        let url = format!("{}/startAudioToVideoSession", self.base_url);
        let body = SessionRequest {
            avatar_id: self.avatar_id.as_deref(),
            api_key: self.api_key.as_deref(),
            is_jpg: false,
            sync_audio: true,
            handle_silence: self.handle_silence,
            max_session_length: self.max_session_length,
            max_idle_time: self.max_idle_time,
            model: self.model.as_deref(),
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::SessionInit(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::SessionInit(if detail.is_empty() {
                format!("unexpected status {}", status)
            } else {
                detail
            }));
        }

        let parsed = response
            .json::<SessionResponse>()
            .await
            .map_err(|e| Error::SessionInit(format!("malformed response: {}", e)))?;

        debug!("acquired session token");
        Ok(parsed.session_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimliClientConfig {
        SimliClientConfig {
            avatar_id: Some("avatar-test".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_request_body_wire_format() {
        let body = SessionRequest {
            avatar_id: Some("avatar-test"),
            api_key: None,
            is_jpg: false,
            sync_audio: true,
            handle_silence: true,
            max_session_length: 3600,
            max_idle_time: 600,
            model: None,
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["avatarId"], "avatar-test");
        assert_eq!(json["isJPG"], false);
        assert_eq!(json["syncAudio"], true);
        assert_eq!(json["handleSilence"], true);
        assert_eq!(json["maxSessionLength"], 3600);
        assert_eq!(json["maxIdleTime"], 600);
        assert!(json.get("apiKey").is_none());
        assert!(json.get("model").is_none());
    }

    #[tokio::test]
    async fn test_configured_token_skips_http() {
        let mut cfg = config();
        cfg.session_token = Some("pre-fetched".to_string());
        // unroutable base URL proves no request is made
        cfg.api_base_url = "http://127.0.0.1:9".to_string();

        let provider = SessionTokenProvider::new(&cfg).unwrap();
        assert_eq!(provider.acquire().await.unwrap(), "pre-fetched");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_session_init_error() {
        let mut cfg = config();
        cfg.api_base_url = "http://127.0.0.1:9".to_string();

        let provider = SessionTokenProvider::new(&cfg).unwrap();
        match provider.acquire().await {
            Err(Error::SessionInit(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
