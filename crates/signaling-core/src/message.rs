//! Typed model of the JSON call-control protocol
//!
//! Messages are method-tagged JSON objects. The two backend generations
//! carry the same payloads; only the outer framing differs and that lives
//! in [`crate::variant`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Reason attached to a `close` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReason {
    /// 0 = normal, 5 = auth failure, 6 = timeout
    pub code: i64,
    #[serde(default)]
    pub text: String,
}

impl CloseReason {
    pub const NORMAL: i64 = 0;
    pub const AUTH_FAILURE: i64 = 5;
    pub const TIMEOUT: i64 = 6;

    pub fn normal() -> Self {
        Self {
            code: Self::NORMAL,
            text: String::new(),
        }
    }
}

/// Audio/video toggles carried by `stream_options`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamOptions {
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

/// Messages this client sends
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// Open a live view, carrying the local SDP offer
    LiveView { sdp: String },
    /// Trickle one local ICE candidate
    Ice { candidate: String, m_line_index: u16 },
    /// Keepalive (newer protocol only)
    Ping,
    /// Keep the remote from expiring the stream
    ActivateSession,
    /// Enable/disable media legs; sent right after activation
    StreamOptions(StreamOptions),
    /// Device-specific toggles, passed through untyped
    CameraOptions(Value),
    /// Graceful teardown
    Close { code: i64 },
}

impl Outgoing {
    /// Wire method name
    pub fn method(&self) -> &'static str {
        match self {
            Outgoing::LiveView { .. } => "live_view",
            Outgoing::Ice { .. } => "ice",
            Outgoing::Ping => "ping",
            Outgoing::ActivateSession => "activate_session",
            Outgoing::StreamOptions(_) => "stream_options",
            Outgoing::CameraOptions(_) => "camera_options",
            Outgoing::Close { .. } => "close",
        }
    }

    /// Payload fields, before variant framing
    pub fn payload(&self) -> Value {
        match self {
            Outgoing::LiveView { sdp } => serde_json::json!({ "sdp": sdp }),
            Outgoing::Ice {
                candidate,
                m_line_index,
            } => serde_json::json!({ "ice": candidate, "mlineindex": m_line_index }),
            Outgoing::Ping => serde_json::json!({}),
            Outgoing::ActivateSession => serde_json::json!({}),
            Outgoing::StreamOptions(options) => {
                serde_json::to_value(options).unwrap_or_default()
            }
            Outgoing::CameraOptions(options) => {
                serde_json::json!({ "camera_options": options })
            }
            Outgoing::Close { code } => {
                serde_json::json!({ "reason": { "code": code, "text": "" } })
            }
        }
    }
}

/// Messages the backend sends, reduced to what the state machine acts on
#[derive(Debug, Clone)]
pub enum IncomingKind {
    /// Session id assigned (older backend wording)
    SessionCreated,
    /// Session id assigned (newer backend wording)
    SessionStarted,
    /// The remote SDP answer
    Sdp { sdp: String },
    /// A remote ICE candidate
    Ice { candidate: String, m_line_index: u16 },
    /// Answer to our ping
    Pong,
    /// Informational notification, surfaced but not acted on
    Notification(Value),
    /// Device option report, surfaced but not acted on
    CameraOptions(Value),
    /// The backend is ending the call
    Close(CloseReason),
    /// Unrecognized method; logged and dropped
    Unknown(String),
}

/// A parsed inbound message plus the session id it referenced, if any
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub session_id: Option<String>,
    pub kind: IncomingKind,
}

/// Decode the payload of an inbound message once the variant framing has
/// been stripped.
pub fn decode_payload(method: &str, body: &Value) -> Result<IncomingMessage> {
    let session_id = body
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let kind = match method {
        "session_created" => IncomingKind::SessionCreated,
        "session_started" => IncomingKind::SessionStarted,
        "sdp" => {
            let sdp = body
                .get("sdp")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Protocol("sdp message without sdp field".into()))?;
            IncomingKind::Sdp {
                sdp: sdp.to_string(),
            }
        }
        "ice" => {
            let candidate = body
                .get("ice")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Protocol("ice message without ice field".into()))?;
            let m_line_index = body
                .get("mlineindex")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u16;
            IncomingKind::Ice {
                candidate: candidate.to_string(),
                m_line_index,
            }
        }
        "pong" => IncomingKind::Pong,
        "notification" => IncomingKind::Notification(body.clone()),
        "camera_options" => IncomingKind::CameraOptions(body.clone()),
        "close" => {
            let reason = body
                .get("reason")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_else(CloseReason::normal);
            IncomingKind::Close(reason)
        }
        other => IncomingKind::Unknown(other.to_string()),
    };

    Ok(IncomingMessage { session_id, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_session_created() {
        let body = serde_json::json!({ "session_id": "abc" });
        let message = decode_payload("session_created", &body).unwrap();
        assert_eq!(message.session_id.as_deref(), Some("abc"));
        assert!(matches!(message.kind, IncomingKind::SessionCreated));
    }

    #[test]
    fn decodes_close_reason() {
        let body = serde_json::json!({ "reason": { "code": 6, "text": "timeout" } });
        let message = decode_payload("close", &body).unwrap();
        match message.kind {
            IncomingKind::Close(reason) => {
                assert_eq!(reason.code, CloseReason::TIMEOUT);
                assert_eq!(reason.text, "timeout");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn sdp_without_field_is_protocol_error() {
        let body = serde_json::json!({});
        assert!(decode_payload("sdp", &body).is_err());
    }

    #[test]
    fn unknown_method_is_tolerated() {
        let message = decode_payload("metrics_report", &serde_json::json!({})).unwrap();
        assert!(matches!(message.kind, IncomingKind::Unknown(_)));
    }
}
