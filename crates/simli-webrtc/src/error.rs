//! Error types for the Simli session client

/// Result type alias using the client Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or running an avatar session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// ICE server discovery failed (one attempt; the resolver degrades
    /// to a fallback instead of surfacing this to callers)
    #[error("ICE server discovery failed: {0}")]
    IceDiscovery(String),

    /// Session token exchange failed
    #[error("Session initialization failed: {0}")]
    SessionInit(String),

    /// Signaling channel error
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// Unexpected or malformed wire message on the critical path
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Audio capture pipeline error
    #[error("Audio capture error: {0}")]
    AudioCapture(String),

    /// A supervised phase exceeded its time budget
    #[error("{0} timed out")]
    Timeout(String),

    /// WebRTC library error (API construction, codec registration)
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable by the orchestrator's attempt loop.
    ///
    /// Transport and negotiation failures are retried up to the configured
    /// attempt bound; configuration and resource-initialization failures
    /// are surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::IceDiscovery(_)
                | Error::SessionInit(_)
                | Error::Signaling(_)
                | Error::WebSocket(_)
                | Error::Sdp(_)
                | Error::Protocol(_)
                | Error::Timeout(_)
                | Error::Io(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}
