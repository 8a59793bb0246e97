//! Wire protocol for the signaling WebSocket
//!
//! The service speaks an ad-hoc string-tagged protocol: exact-match
//! control tokens, `pong <echo>` replies, and JSON payloads of which only
//! `{"type":"answer",...}` is meaningful. Every inbound text frame is
//! decoded here, once, into [`SignalingMessage`]; nothing downstream
//! pattern-matches on raw strings.

use serde::Deserialize;

/// Outbound buffer-clear request
pub const CLEAR_BUFFER: &str = "SKIP";

/// Prefix of outbound liveness pings (`ping <epoch-ms>`)
pub const PING_PREFIX: &str = "ping";

/// Prefix of inbound ping replies (`pong <echoed-ping>`)
pub const PONG_PREFIX: &str = "pong";

/// Exact-match control tokens sent by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    /// Session is active; audio may flow
    Start,
    /// Session ended by the service
    Stop,
    /// Payload acknowledged
    Ack,
    /// Avatar started speaking
    Speak,
    /// Avatar went silent
    Silent,
}

impl ControlToken {
    /// Parse an exact wire token
    pub fn from_wire(text: &str) -> Option<Self> {
        match text {
            "START" => Some(ControlToken::Start),
            "STOP" => Some(ControlToken::Stop),
            "ACK" => Some(ControlToken::Ack),
            "SPEAK" => Some(ControlToken::Speak),
            "SILENT" => Some(ControlToken::Silent),
            _ => None,
        }
    }

    /// The exact string this token has on the wire
    pub fn as_wire(&self) -> &'static str {
        match self {
            ControlToken::Start => "START",
            ControlToken::Stop => "STOP",
            ControlToken::Ack => "ACK",
            ControlToken::Speak => "SPEAK",
            ControlToken::Silent => "SILENT",
        }
    }
}

/// A decoded inbound signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// One of the exact-match control tokens
    Control(ControlToken),
    /// `pong <echo>` liveness reply; `payload` is the full frame text
    Pong {
        /// Full wire text, correlated against the pending-ping map
        payload: String,
    },
    /// Remote SDP answer extracted from a `{"type":"answer"}` payload
    Answer {
        /// The SDP body
        sdp: String,
    },
    /// Anything unrecognized; ignored with a warning by the receiver
    Raw(String),
}

#[derive(Deserialize)]
struct SdpPayload {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

/// Decode one inbound text frame
///
/// Never fails: unparseable input degrades to [`SignalingMessage::Raw`].
pub fn parse(text: &str) -> SignalingMessage {
    if let Some(token) = ControlToken::from_wire(text) {
        return SignalingMessage::Control(token);
    }

    if text.starts_with(PONG_PREFIX) {
        return SignalingMessage::Pong {
            payload: text.to_string(),
        };
    }

    if let Ok(payload) = serde_json::from_str::<SdpPayload>(text) {
        if payload.kind == "answer" {
            return SignalingMessage::Answer { sdp: payload.sdp };
        }
    }

    SignalingMessage::Raw(text.to_string())
}

/// Build an outbound `ping <epoch-ms>` frame
pub fn ping_message(epoch_ms: u128) -> String {
    format!("{} {}", PING_PREFIX, epoch_ms)
}

/// Derive the pending-ping key for a `pong <echo>` payload
pub fn pong_to_ping_key(pong_payload: &str) -> String {
    pong_payload.replacen(PONG_PREFIX, PING_PREFIX, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_tokens_parse_exactly() {
        assert_eq!(parse("START"), SignalingMessage::Control(ControlToken::Start));
        assert_eq!(parse("STOP"), SignalingMessage::Control(ControlToken::Stop));
        assert_eq!(parse("ACK"), SignalingMessage::Control(ControlToken::Ack));
        assert_eq!(parse("SPEAK"), SignalingMessage::Control(ControlToken::Speak));
        assert_eq!(parse("SILENT"), SignalingMessage::Control(ControlToken::Silent));
        // case and whitespace sensitive
        assert!(matches!(parse("start"), SignalingMessage::Raw(_)));
        assert!(matches!(parse("START "), SignalingMessage::Raw(_)));
    }

    #[test]
    fn test_pong_keeps_full_payload() {
        match parse("pong 1712000000000") {
            SignalingMessage::Pong { payload } => {
                assert_eq!(payload, "pong 1712000000000");
                assert_eq!(pong_to_ping_key(&payload), "ping 1712000000000");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_answer_payload() {
        let text = r#"{"type":"answer","sdp":"v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\n"}"#;
        match parse(text) {
            SignalingMessage::Answer { sdp } => assert!(sdp.starts_with("v=0")),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_non_answer_json_is_raw() {
        assert!(matches!(
            parse(r#"{"type":"offer","sdp":"v=0"}"#),
            SignalingMessage::Raw(_)
        ));
        assert!(matches!(parse(r#"{"hello":"world"}"#), SignalingMessage::Raw(_)));
    }

    #[test]
    fn test_garbage_is_raw() {
        assert!(matches!(parse("{not json"), SignalingMessage::Raw(_)));
        assert!(matches!(parse(""), SignalingMessage::Raw(_)));
    }

    #[test]
    fn test_ping_message_format() {
        assert_eq!(ping_message(42), "ping 42");
    }
}
