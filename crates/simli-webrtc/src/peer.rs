//! WebRTC peer connection management
//!
//! Wraps a webrtc-rs `RTCPeerConnection` configured for the avatar
//! session: recvonly audio/video transceivers, an ordered `"chat"` data
//! channel in the offer, and listeners that report connection
//! observations to the orchestrator without ever mutating its state.

use crate::health::{deadline, ICE_GATHERING_TIMEOUT, ICE_POLL_INTERVAL};
use crate::ice::IceServer;
use crate::media::MediaSink;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

/// Connection observation reported to the orchestrator
///
/// `Failed` and `Closed` are terminal for the attempt; `Disconnected` is
/// non-terminal and only triggers reconnection if the session had
/// previously reached Active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerObservation {
    /// The connection reached the connected state
    Connected,
    /// The connection dropped; may recover or be re-established
    Disconnected,
    /// The connection failed terminally
    Failed(String),
    /// The connection was closed
    Closed,
}

/// Owns the native peer connection for one session attempt
pub struct PeerConnectionManager {
    /// Unique identifier for this connection instance (log correlation)
    connection_id: String,

    /// The native WebRTC peer connection
    pc: Arc<RTCPeerConnection>,

    /// Data channel carried in the offer; the remote expects its m-line
    data_channel: Arc<RTCDataChannel>,

    /// Local candidates observed in the current gathering phase
    candidate_count: Arc<AtomicU64>,

    /// Set when the native gatherer reports Complete
    gathering_complete: Arc<AtomicBool>,

    /// Wakes the gathering wait when the native state completes
    gathering_notify: Arc<Notify>,
}

impl PeerConnectionManager {
    /// Create a peer connection from resolved ICE servers
    ///
    /// # Arguments
    ///
    /// * `ice_servers` - servers for this attempt, consumed once
    /// * `media_sink` - receiver of incoming remote tracks
    /// * `observations` - channel reporting connection state observations
    pub async fn new(
        ice_servers: Vec<IceServer>,
        media_sink: Arc<dyn MediaSink>,
        observations: mpsc::UnboundedSender<PeerObservation>,
    ) -> Result<Self> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        info!(connection_id = %connection_id, "creating peer connection");

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtc(format!("failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_ice_servers: Vec<RTCIceServer> = ice_servers
            .into_iter()
            .map(|server| RTCIceServer {
                urls: server.urls,
                username: server.username.unwrap_or_default(),
                credential: server.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers: rtc_ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnection(format!("failed to create peer connection: {}", e))
        })?);

        let candidate_count = Arc::new(AtomicU64::new(0));
        let gathering_complete = Arc::new(AtomicBool::new(false));
        let gathering_notify = Arc::new(Notify::new());

        {
            let candidate_count = candidate_count.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if candidate.is_some() {
                    let total = candidate_count.fetch_add(1, Ordering::AcqRel) + 1;
                    debug!(total, "gathered local ICE candidate");
                } else {
                    debug!("end of local ICE candidates");
                }
                Box::pin(async {})
            }));
        }

        {
            let complete = gathering_complete.clone();
            let notify = gathering_notify.clone();
            pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                debug!(?state, "ICE gathering state changed");
                if state == RTCIceGathererState::Complete {
                    complete.store(true, Ordering::Release);
                    notify.notify_waiters();
                }
                Box::pin(async {})
            }));
        }

        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            debug!(?state, "ICE connection state changed");
            Box::pin(async {})
        }));

        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            debug!(?state, "signaling state changed");
            Box::pin(async {})
        }));

        {
            let observations = observations.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!(?state, "peer connection state changed");
                let observation = match state {
                    RTCPeerConnectionState::Connected => Some(PeerObservation::Connected),
                    RTCPeerConnectionState::Disconnected => Some(PeerObservation::Disconnected),
                    RTCPeerConnectionState::Failed => Some(PeerObservation::Failed(
                        "peer connection failed".to_string(),
                    )),
                    RTCPeerConnectionState::Closed => Some(PeerObservation::Closed),
                    _ => None,
                };
                if let Some(observation) = observation {
                    let _ = observations.send(observation);
                }
                Box::pin(async {})
            }));
        }

        {
            let sink = media_sink.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let sink = sink.clone();
                Box::pin(async move {
                    match track.kind() {
                        RTPCodecType::Audio => {
                            debug!(id = %track.id(), "incoming remote audio track");
                            sink.on_audio_track(track);
                        }
                        RTPCodecType::Video => {
                            debug!(id = %track.id(), "incoming remote video track");
                            sink.on_video_track(track);
                        }
                        _ => warn!(id = %track.id(), "remote track with unspecified kind"),
                    }
                })
            }));
        }

        // The service expects the data channel m-line in the offer even
        // though control traffic flows over the signaling socket.
        let data_channel = pc
            .create_data_channel(
                "chat",
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::PeerConnection(format!("failed to create data channel: {}", e)))?;

        data_channel.on_close(Box::new(|| {
            debug!("data channel closed");
            Box::pin(async {})
        }));

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| {
                Error::PeerConnection(format!("failed to add {:?} transceiver: {}", kind, e))
            })?;
        }

        Ok(Self {
            connection_id,
            pc,
            data_channel,
            candidate_count,
            gathering_complete,
            gathering_notify,
        })
    }

    /// Build the local offer and wait for ICE gathering to converge
    ///
    /// Returns the local description serialized as the wire JSON payload
    /// (`{"type":"offer","sdp":...}`).
    pub async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Sdp(format!("failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Sdp(format!("failed to set local description: {}", e)))?;

        self.wait_for_ice_gathering().await?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("no local description after gathering".to_string()))?;

        debug!(
            connection_id = %self.connection_id,
            candidates = self.candidate_count(),
            "local offer ready"
        );

        serde_json::to_string(&local)
            .map_err(|e| Error::Sdp(format!("failed to encode offer: {}", e)))
    }

    /// Wait until ICE gathering has converged
    ///
    /// Converged means the native gatherer reported Complete, or two
    /// consecutive polls observed an unchanged candidate count — the
    /// stabilization heuristic bounds gathering latency when the native
    /// implementation delays its state transition. A hard deadline aborts
    /// the wait regardless.
    pub async fn wait_for_ice_gathering(&self) -> Result<()> {
        let complete = self.gathering_complete.clone();
        let notify = self.gathering_notify.clone();
        let counter = self.candidate_count.clone();

        deadline("ICE gathering", ICE_GATHERING_TIMEOUT, async move {
            let mut previous: Option<u64> = None;
            let mut ticker = tokio::time::interval(ICE_POLL_INTERVAL);
            ticker.tick().await;

            loop {
                if complete.load(Ordering::Acquire) {
                    debug!("ICE gathering complete");
                    return Ok(());
                }

                let count = counter.load(Ordering::Acquire);
                if previous == Some(count) {
                    debug!(count, "ICE gathering converged on stable candidate count");
                    return Ok(());
                }
                previous = Some(count);

                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notify.notified() => {}
                }
            }
        })
        .await
    }

    /// Apply the remote SDP answer
    pub async fn apply_answer(&self, sdp: &str) -> Result<()> {
        debug!(connection_id = %self.connection_id, "applying remote answer");

        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| Error::Sdp(format!("failed to parse answer: {}", e)))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::Sdp(format!("failed to set remote description: {}", e)))
    }

    /// Current native connection state
    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    /// Candidates gathered in the current gathering phase
    pub fn candidate_count(&self) -> u64 {
        self.candidate_count.load(Ordering::Acquire)
    }

    /// This connection instance's identifier
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Close the underlying connection
    pub async fn close(&self) -> Result<()> {
        info!(connection_id = %self.connection_id, "closing peer connection");

        self.data_channel.close().await.ok();
        self.pc
            .close()
            .await
            .map_err(|e| Error::PeerConnection(format!("failed to close connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NullMediaSink;

    async fn manager() -> PeerConnectionManager {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerConnectionManager::new(vec![IceServer::fallback()], Arc::new(NullMediaSink), tx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_peer_connection_creation() {
        let pc = manager().await;
        assert_eq!(pc.connection_state(), RTCPeerConnectionState::New);
        assert_eq!(pc.candidate_count(), 0);
        assert!(!pc.connection_id().is_empty());
    }

    #[tokio::test]
    async fn test_create_offer_includes_media_and_data_sections() {
        let pc = manager().await;

        let offer_json = pc.create_offer().await.unwrap();
        let payload: serde_json::Value = serde_json::from_str(&offer_json).unwrap();
        assert_eq!(payload["type"], "offer");

        let sdp = payload["sdp"].as_str().unwrap();
        assert!(sdp.contains("audio"));
        assert!(sdp.contains("video"));
        assert!(sdp.contains("application"));
    }

    #[tokio::test]
    async fn test_apply_answer_rejects_garbage() {
        let pc = manager().await;
        pc.create_offer().await.unwrap();

        assert!(matches!(
            pc.apply_answer("not an sdp").await,
            Err(Error::Sdp(_))
        ));
    }

    #[tokio::test]
    async fn test_close() {
        let pc = manager().await;
        pc.close().await.unwrap();
    }
}
