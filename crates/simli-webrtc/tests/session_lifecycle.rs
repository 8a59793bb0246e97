//! End-to-end session lifecycle tests against an in-process mock of the
//! vendor service: HTTP ICE discovery + token exchange, and the signaling
//! WebSocket backed by a real webrtc-rs answering peer.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use simli_webrtc::{
    ConnectionState, NullMediaSink, RetryPolicy, SessionEvent, SessionEventKind, SimliClient,
    SimliClientConfig, FRAME_BYTES,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

const SESSION_TOKEN: &str = "test-session-token";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// What the mock service observed on the signaling socket, in order
#[derive(Debug, Clone, PartialEq, Eq)]
enum ServerSeen {
    /// First message: the SDP payload's `type` field
    Offer(String),
    /// Second message: the raw session token
    Token(String),
    /// A binary audio frame of this content
    Audio(Vec<u8>),
    /// A `SKIP` buffer-clear request
    Skip,
    /// The socket closed
    Closed,
}

/// A text frame for the mock to push to the client
struct Push(String);

struct MockState {
    ice_failures: AtomicU32,
    seen: mpsc::UnboundedSender<ServerSeen>,
    push_rx: Mutex<Option<mpsc::UnboundedReceiver<Push>>>,
}

struct MockVendor {
    port: u16,
    push: mpsc::UnboundedSender<Push>,
}

impl MockVendor {
    /// Spawn the mock service; the first `ice_failures` ICE requests 500
    async fn spawn(ice_failures: u32) -> (Self, mpsc::UnboundedReceiver<ServerSeen>) {
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let state = Arc::new(MockState {
            ice_failures: AtomicU32::new(ice_failures),
            seen: seen_tx,
            push_rx: Mutex::new(Some(push_rx)),
        });

        let app = Router::new()
            .route("/getIceServers", post(get_ice_servers))
            .route("/startAudioToVideoSession", post(start_session))
            .route("/StartWebRTCSession", get(ws_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (Self { port, push: push_tx }, seen_rx)
    }

    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    fn push(&self, text: &str) {
        self.push.send(Push(text.to_string())).unwrap();
    }
}

async fn get_ice_servers(State(state): State<Arc<MockState>>) -> Response {
    if state.ice_failures.load(Ordering::SeqCst) > 0 {
        state.ice_failures.fetch_sub(1, Ordering::SeqCst);
        return (StatusCode::INTERNAL_SERVER_ERROR, "ice backend down").into_response();
    }
    Json(serde_json::json!([{"urls": ["stun:stun.l.google.com:19302"]}])).into_response()
}

async fn start_session(Json(body): Json<serde_json::Value>) -> Response {
    assert_eq!(body["isJPG"], false);
    assert_eq!(body["syncAudio"], true);
    Json(serde_json::json!({ "session_token": SESSION_TOKEN })).into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<MockState>>) -> Response {
    ws.on_upgrade(move |socket| session_handler(socket, state))
}

/// Mock signaling session: expects offer then token, replies with a real
/// SDP answer and START, then relays pushed frames and records traffic
async fn session_handler(mut socket: WebSocket, state: Arc<MockState>) {
    let offer_text = match socket.recv().await {
        Some(Ok(WsMessage::Text(text))) => text,
        other => panic!("expected offer as the first message, got {:?}", other),
    };
    let offer: serde_json::Value = serde_json::from_str(&offer_text).expect("offer is JSON");
    let _ = state.seen.send(ServerSeen::Offer(
        offer["type"].as_str().unwrap_or_default().to_string(),
    ));

    let token = match socket.recv().await {
        Some(Ok(WsMessage::Text(text))) => text,
        other => panic!("expected token as the second message, got {:?}", other),
    };
    let _ = state.seen.send(ServerSeen::Token(token));

    let answer = build_answer(offer["sdp"].as_str().expect("offer carries sdp")).await;
    socket
        .send(WsMessage::Text(serde_json::to_string(&answer).unwrap()))
        .await
        .unwrap();
    socket.send(WsMessage::Text("START".to_string())).await.unwrap();

    let mut push_rx = state.push_rx.lock().await.take();

    loop {
        tokio::select! {
            push = async {
                match push_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match push {
                    Some(Push(text)) => {
                        if socket.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => push_rx = None,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) if text.starts_with("ping") => {
                        let pong = text.replacen("ping", "pong", 1);
                        let _ = socket.send(WsMessage::Text(pong)).await;
                    }
                    Some(Ok(WsMessage::Text(text))) if text == "SKIP" => {
                        let _ = state.seen.send(ServerSeen::Skip);
                    }
                    Some(Ok(WsMessage::Binary(frame))) => {
                        let _ = state.seen.send(ServerSeen::Audio(frame));
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        let _ = state.seen.send(ServerSeen::Closed);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Answer the client's offer with a real webrtc-rs peer
async fn build_answer(offer_sdp: &str) -> RTCSessionDescription {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let registry = register_default_interceptors(Default::default(), &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap();

    pc.set_remote_description(RTCSessionDescription::offer(offer_sdp.to_string()).unwrap())
        .await
        .unwrap();

    let answer = pc.create_answer(None).await.unwrap();
    pc.set_local_description(answer).await.unwrap();
    pc.local_description().await.unwrap()
}

fn subscribe_all(client: &SimliClient) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in [
        SessionEventKind::Connected,
        SessionEventKind::Disconnected,
        SessionEventKind::Failed,
        SessionEventKind::Speaking,
        SessionEventKind::Silent,
    ] {
        let tx = tx.clone();
        client.on(kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }
    rx
}

async fn recv_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event stream ended")
}

async fn recv_seen(rx: &mut mpsc::UnboundedReceiver<ServerSeen>) -> ServerSeen {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for server observation")
        .expect("observation stream ended")
}

#[tokio::test]
async fn full_session_lifecycle_against_mock_service() {
    init_tracing();

    // three ICE discovery failures: the resolver must fall back to the
    // public STUN server and the connection must still come up
    let (server, mut seen) = MockVendor::spawn(3).await;

    let config = SimliClientConfig {
        api_base_url: server.base_url(),
        avatar_id: Some("avatar-test".to_string()),
        ice_retry: RetryPolicy {
            max_attempts: 3,
            delay_ms: 10,
        },
        connect_retry: RetryPolicy {
            max_attempts: 1,
            delay_ms: 10,
        },
        ..Default::default()
    };

    let client = SimliClient::new(config, Arc::new(NullMediaSink)).unwrap();
    let mut events = subscribe_all(&client);

    client.start().await.expect("session should negotiate");

    assert_eq!(recv_event(&mut events).await, SessionEvent::Connected);

    // wire ordering: offer, then token, then the zero-filled primer frame
    assert_eq!(recv_seen(&mut seen).await, ServerSeen::Offer("offer".to_string()));
    assert_eq!(
        recv_seen(&mut seen).await,
        ServerSeen::Token(SESSION_TOKEN.to_string())
    );
    match recv_seen(&mut seen).await {
        ServerSeen::Audio(frame) => {
            assert_eq!(frame.len(), FRAME_BYTES);
            assert!(frame.iter().all(|&b| b == 0), "primer frame must be silent");
        }
        other => panic!("expected primer frame, got {:?}", other),
    }

    let status = client.connection_status();
    assert_eq!(status.state, ConnectionState::Active);
    assert!(status.session_active);
    assert!(status.websocket_open);
    assert_eq!(status.connection_attempts, 1);

    // speaking state follows SPEAK/SILENT control tokens
    server.push("SPEAK");
    assert_eq!(recv_event(&mut events).await, SessionEvent::Speaking);
    assert!(client.is_avatar_speaking());

    server.push("SILENT");
    assert_eq!(recv_event(&mut events).await, SessionEvent::Silent);
    assert!(!client.is_avatar_speaking());

    // microphone-sourced audio flows while active
    let frame = vec![7u8; FRAME_BYTES];
    client.send_audio_data(&frame);
    assert_eq!(recv_seen(&mut seen).await, ServerSeen::Audio(frame));

    // buffer-clear request reaches the service
    client.clear_buffer();
    assert_eq!(recv_seen(&mut seen).await, ServerSeen::Skip);

    // unknown control tokens are ignored without disturbing the session
    server.push("UNEXPECTED_TOKEN");
    server.push("SPEAK");
    assert_eq!(recv_event(&mut events).await, SessionEvent::Speaking);

    client.close().await;
    assert_eq!(recv_event(&mut events).await, SessionEvent::Disconnected);
    assert_eq!(client.connection_status().state, ConnectionState::Disconnected);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn failing_transport_yields_bounded_attempts_and_one_failed_event() {
    init_tracing();

    // nothing listens on the discard port: ICE discovery degrades to the
    // fallback and the WebSocket connect fails every attempt
    let config = SimliClientConfig {
        api_base_url: "http://127.0.0.1:9".to_string(),
        avatar_id: Some("avatar-test".to_string()),
        session_token: Some("pre-fetched".to_string()),
        ice_retry: RetryPolicy {
            max_attempts: 1,
            delay_ms: 10,
        },
        connect_retry: RetryPolicy {
            max_attempts: 2,
            delay_ms: 50,
        },
        ..Default::default()
    };

    let client = SimliClient::new(config, Arc::new(NullMediaSink)).unwrap();
    let mut events = subscribe_all(&client);

    client.start().await.expect_err("start must fail");

    let status = client.connection_status();
    assert_eq!(status.state, ConnectionState::Failed);
    assert_eq!(status.connection_attempts, 2);
    assert!(status.error_reason.is_some());

    // exactly one terminal failed event, regardless of attempt count
    match recv_event(&mut events).await {
        SessionEvent::Failed(reason) => assert!(reason.contains("2 attempt")),
        other => panic!("expected failed event, got {:?}", other),
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .is_err(),
        "no further events may follow the terminal failure"
    );

    // audio is dropped silently in the failed state
    client.send_audio_data(&[0u8; FRAME_BYTES]);
}

#[tokio::test]
async fn stop_token_ends_the_session() {
    init_tracing();

    let (server, mut seen) = MockVendor::spawn(0).await;

    let config = SimliClientConfig {
        api_base_url: server.base_url(),
        avatar_id: Some("avatar-test".to_string()),
        connect_retry: RetryPolicy {
            max_attempts: 1,
            delay_ms: 10,
        },
        ..Default::default()
    };

    let client = SimliClient::new(config, Arc::new(NullMediaSink)).unwrap();
    let mut events = subscribe_all(&client);

    client.start().await.expect("session should negotiate");
    assert_eq!(recv_event(&mut events).await, SessionEvent::Connected);

    // drain offer/token/primer observations
    let _ = recv_seen(&mut seen).await;
    let _ = recv_seen(&mut seen).await;
    let _ = recv_seen(&mut seen).await;

    server.push("STOP");
    assert_eq!(recv_event(&mut events).await, SessionEvent::Disconnected);

    // the session is gone; audio is silently dropped
    client.send_audio_data(&[0u8; FRAME_BYTES]);
    assert_eq!(client.connection_status().state, ConnectionState::Disconnected);
}
