//! WebSocket signaling channel
//!
//! Owns the single WebSocket connection to the service. Outbound traffic
//! is queued onto an unbounded channel drained by a sender task; a
//! receiver task decodes every inbound text frame through [`protocol`]
//! and forwards discrete [`SignalingEvent`]s to the orchestrator.
//!
//! Wire ordering is mandatory: the local SDP offer is the first message
//! on the socket, the raw session token the second. The remote side
//! rejects sessions that send the token first.

pub mod protocol;

pub use protocol::{ControlToken, SignalingMessage};

use crate::health::{deadline, PingTracker, WS_CONNECT_TIMEOUT};
use crate::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Discrete events surfaced to the orchestrator
#[derive(Debug)]
pub enum SignalingEvent {
    /// A decoded inbound message
    Message(SignalingMessage),
    /// The socket closed or errored; the session cannot continue on it
    Closed(String),
}

/// Derive the signaling WebSocket URL from the vendor HTTP base URL
///
/// `https` maps to `wss`, `http` to `ws`; the session path is appended to
/// any path already present on the base URL.
pub fn derive_ws_url(base_url: &str, ticket: Option<&str>) -> Result<String> {
    let parsed = Url::parse(base_url)
        .map_err(|e| Error::InvalidConfig(format!("invalid base URL {}: {}", base_url, e)))?;

    let scheme = if parsed.scheme() == "https" { "wss" } else { "ws" };
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::InvalidConfig(format!("base URL {} has no host", base_url)))?;

    let mut url = format!("{}://{}", scheme, host);
    if let Some(port) = parsed.port() {
        url.push_str(&format!(":{}", port));
    }
    url.push_str(parsed.path().trim_end_matches('/'));
    url.push_str("/StartWebRTCSession");

    if let Some(ticket) = ticket {
        url.push_str("?token=");
        url.push_str(ticket);
    }

    Ok(url)
}

/// The single signaling WebSocket connection
pub struct SignalingChannel {
    tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl SignalingChannel {
    /// Open the WebSocket and start the sender/receiver tasks
    ///
    /// Connection establishment is bounded by the WebSocket connect
    /// budget. Returns the channel handle and the event stream.
    pub async fn connect(
        url: &str,
        pings: Arc<PingTracker>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>)> {
        info!(url, "connecting to signaling endpoint");

        let (ws_stream, _) = deadline("WebSocket connect", WS_CONNECT_TIMEOUT, async {
            connect_async(url)
                .await
                .map_err(|e| Error::WebSocket(format!("failed to connect: {}", e)))
        })
        .await?;

        debug!("signaling WebSocket connected");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::sender_task(write, rx, open.clone()));
        tokio::spawn(Self::receiver_task(read, event_tx, open.clone(), pings));

        Ok((Self { tx, open }, event_rx))
    }

    /// Sender task: drains queued messages onto the WebSocket
    async fn sender_task(
        mut write: SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        open: Arc<AtomicBool>,
    ) {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!(error = %e, "failed to send WebSocket message");
                break;
            }
            if is_close {
                break;
            }
        }

        open.store(false, Ordering::Release);
        debug!("signaling sender task terminated");
    }

    /// Receiver task: decodes inbound frames and forwards events
    async fn receiver_task(
        mut read: SplitStream<WsStream>,
        events: mpsc::UnboundedSender<SignalingEvent>,
        open: Arc<AtomicBool>,
        pings: Arc<PingTracker>,
    ) {
        let mut close_reason: Option<String> = None;

        while let Some(result) = read.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    let msg = protocol::parse(&text);
                    match &msg {
                        SignalingMessage::Pong { payload } => {
                            if pings.observe_pong(payload).is_none() {
                                debug!(payload = %payload, "pong without a pending ping");
                            }
                        }
                        SignalingMessage::Raw(raw) => {
                            warn!(message = %raw, "ignoring unrecognized signaling message");
                        }
                        _ => {}
                    }
                    if events.send(SignalingEvent::Message(msg)).is_err() {
                        break;
                    }
                }
                Ok(Message::Binary(_)) => {
                    debug!("ignoring inbound binary frame");
                }
                Ok(Message::Close(_)) => {
                    info!("signaling WebSocket closed by remote");
                    close_reason = Some("closed by remote".to_string());
                    break;
                }
                Ok(_) => {} // transport-level ping/pong, handled by tungstenite
                Err(e) => {
                    error!(error = %e, "signaling WebSocket error");
                    close_reason = Some(e.to_string());
                    break;
                }
            }
        }

        open.store(false, Ordering::Release);
        let reason = close_reason.unwrap_or_else(|| "connection ended".to_string());
        let _ = events.send(SignalingEvent::Closed(reason));
        debug!("signaling receiver task terminated");
    }

    fn send_message(&self, msg: Message) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Signaling("signaling channel is not open".to_string()));
        }
        self.tx
            .send(msg)
            .map_err(|e| Error::Signaling(format!("failed to queue message: {}", e)))
    }

    /// Send the local SDP offer (JSON). Must precede the session token.
    pub fn send_offer(&self, offer_json: &str) -> Result<()> {
        debug!("sending local SDP offer");
        self.send_message(Message::Text(offer_json.to_string()))
    }

    /// Send the raw session token string
    pub fn send_session_token(&self, token: &str) -> Result<()> {
        debug!("sending session token");
        self.send_message(Message::Text(token.to_string()))
    }

    /// Send one binary audio frame
    pub fn send_audio(&self, frame: &[u8]) -> Result<()> {
        self.send_message(Message::Binary(frame.to_vec()))
    }

    /// Ask the service to drop any buffered audio
    pub fn send_clear_buffer(&self) -> Result<()> {
        self.send_message(Message::Text(protocol::CLEAR_BUFFER.to_string()))
    }

    /// Send a liveness ping frame
    pub fn send_ping(&self, text: &str) -> Result<()> {
        self.send_message(Message::Text(text.to_string()))
    }

    /// Whether the transport is currently open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Initiate the close handshake and mark the channel closed
    ///
    /// Safe to call multiple times.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!("closing signaling channel");
            let _ = self.tx.send(Message::Close(None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_from_https_base() {
        let url = derive_ws_url("https://api.simli.ai", None).unwrap();
        assert_eq!(url, "wss://api.simli.ai/StartWebRTCSession");
    }

    #[test]
    fn test_ws_url_from_http_base_keeps_port() {
        let url = derive_ws_url("http://127.0.0.1:8080", None).unwrap();
        assert_eq!(url, "ws://127.0.0.1:8080/StartWebRTCSession");
    }

    #[test]
    fn test_ws_url_appends_to_existing_path() {
        let url = derive_ws_url("https://vendor.example.com/api/v2/", None).unwrap();
        assert_eq!(url, "wss://vendor.example.com/api/v2/StartWebRTCSession");
    }

    #[test]
    fn test_ws_url_with_ticket() {
        let url = derive_ws_url("https://api.simli.ai", Some("abc123")).unwrap();
        assert_eq!(url, "wss://api.simli.ai/StartWebRTCSession?token=abc123");
    }

    #[test]
    fn test_ws_url_rejects_invalid_base() {
        assert!(derive_ws_url("not a url", None).is_err());
    }
}
