//! Configuration types for the Simli session client

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default vendor API base URL
pub const DEFAULT_API_BASE_URL: &str = "https://api.simli.ai";

/// Retry policy for a bounded attempt loop
///
/// Used independently for ICE discovery retries and for full-connection
/// retries; the two may carry different bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (default: 3)
    pub max_attempts: u32,

    /// Fixed inter-attempt delay in milliseconds (default: 1500ms)
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1500,
        }
    }
}

impl RetryPolicy {
    /// Inter-attempt delay as a Duration
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Check if more attempts are allowed after `attempt` (1-indexed)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Main configuration for SimliClient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimliClientConfig {
    /// Vendor API base URL (http:// or https://); the signaling WebSocket
    /// URL is derived from it
    pub api_base_url: String,

    /// Avatar/face identifier for the session metadata
    pub avatar_id: Option<String>,

    /// API key, accepted by the vendor in place of an avatar id
    pub api_key: Option<String>,

    /// Pre-fetched session token. When set, no token exchange is issued
    /// and the value is reused for the lifetime of this client.
    pub session_token: Option<String>,

    /// Ask the service to synthesize idle motion during silence (default: true)
    pub handle_silence: bool,

    /// Maximum session length in seconds (default: 3600)
    pub max_session_length: u64,

    /// Maximum idle time in seconds before the service ends the session
    /// (default: 600)
    pub max_idle_time: u64,

    /// Optional rendering model override
    pub model: Option<String>,

    /// Retry policy for the full connection sequence
    pub connect_retry: RetryPolicy,

    /// Retry policy for ICE server discovery
    pub ice_retry: RetryPolicy,
}

impl Default for SimliClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            avatar_id: None,
            api_key: None,
            session_token: None,
            handle_silence: true,
            max_session_length: 3600,
            max_idle_time: 600,
            model: None,
            connect_retry: RetryPolicy::default(),
            ice_retry: RetryPolicy::default(),
        }
    }
}

impl SimliClientConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `api_base_url` is not an http(s) URL
    /// - neither `avatar_id`, `api_key`, nor `session_token` is set
    /// - either retry policy allows zero attempts
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://")
        {
            return Err(Error::InvalidConfig(format!(
                "api_base_url must start with http:// or https://, got {}",
                self.api_base_url
            )));
        }

        if self.avatar_id.is_none() && self.api_key.is_none() && self.session_token.is_none() {
            return Err(Error::InvalidConfig(
                "one of avatar_id, api_key, or session_token is required".to_string(),
            ));
        }

        if self.connect_retry.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "connect_retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.ice_retry.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "ice_retry.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
