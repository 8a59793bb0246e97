//! WebRTC session client for the Simli avatar streaming API
//!
//! This crate establishes and supervises a real-time audio/video session
//! with the avatar-rendering service: it negotiates a peer connection
//! over the vendor's WebSocket signaling endpoint, streams microphone
//! audio as fixed-size PCM frames, and relays session control messages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  SimliClient (orchestrator state machine)                │
//! │  ├─ IceServerResolver   (POST /getIceServers, fallback)  │
//! │  ├─ SessionTokenProvider (POST /startAudioToVideoSession)│
//! │  ├─ PeerConnectionManager (webrtc-rs offer/answer)       │
//! │  ├─ SignalingChannel    (WebSocket /StartWebRTCSession)  │
//! │  ├─ AudioCapturePipeline (f32 mic -> 6000-byte frames)   │
//! │  └─ EventBus            (connected/disconnected/...)     │
//! │       ↓ remote tracks                                    │
//! │  MediaSink (embedding application)                       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use simli_webrtc::{NullMediaSink, SessionEventKind, SimliClient, SimliClientConfig};
//! use std::sync::Arc;
//!
//! let config = SimliClientConfig {
//!     avatar_id: Some("my-avatar".to_string()),
//!     ..Default::default()
//! };
//!
//! let client = SimliClient::new(config, Arc::new(NullMediaSink))?;
//! client.on(SessionEventKind::Connected, |_| println!("avatar session live"));
//!
//! client.start().await?;
//!
//! // feed microphone samples
//! let (mic_tx, mic_rx) = tokio::sync::mpsc::channel(64);
//! client.listen_to_mediastream_track(mic_rx);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod config;
pub mod error;
pub mod events;
pub mod media;

// Internal modules
mod client;
mod health;
mod ice;
mod peer;
mod session;
mod signaling;

// Re-exports for public API
pub use client::{ConnectionState, ConnectionStatus, SimliClient};
pub use config::{RetryPolicy, SimliClientConfig, DEFAULT_API_BASE_URL};
pub use error::{Error, Result};
pub use events::{HandlerId, SessionEvent, SessionEventKind};
pub use ice::{IceServer, FALLBACK_STUN_URL};
pub use media::{MediaSink, NullMediaSink, FRAME_BYTES, FRAME_SAMPLES, TARGET_SAMPLE_RATE};
pub use peer::PeerObservation;
pub use signaling::{ControlToken, SignalingMessage};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
