//! Backend protocol variants
//!
//! Both backend generations share the call state machine; a variant only
//! decides how messages are framed and which quirks apply.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::{decode_payload, IncomingMessage, Outgoing};

/// Which backend generation a connection speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    /// Older backend: messages are flat JSON objects with the fields next
    /// to the `method` tag. No keepalive ping.
    Flat,
    /// Newer backend: every message is wrapped in a dialog envelope with
    /// a client-generated dialog id, and a ping is required every 5s.
    Dialog,
}

impl ProtocolVariant {
    /// Whether this variant requires the 5-second keepalive ping
    pub fn sends_keepalive_ping(&self) -> bool {
        matches!(self, ProtocolVariant::Dialog)
    }

    /// Whether local ICE candidates must be sent twice, once per m-line
    /// index. The dialog backend otherwise connects only one media leg;
    /// this is a remote-side quirk, preserved as observed.
    pub fn duplicates_mline_ice(&self) -> bool {
        matches!(self, ProtocolVariant::Dialog)
    }

    /// Frame an outbound message for the wire
    pub fn frame(&self, device_id: u64, dialog_id: &str, message: &Outgoing) -> Result<String> {
        let payload = message.payload();
        let framed = match self {
            ProtocolVariant::Flat => {
                let mut object = payload;
                let map = object
                    .as_object_mut()
                    .ok_or_else(|| Error::Protocol("payload is not an object".into()))?;
                map.insert("method".into(), Value::String(message.method().into()));
                map.insert("device_id".into(), Value::from(device_id));
                object
            }
            ProtocolVariant::Dialog => {
                let mut body = payload;
                if let Some(map) = body.as_object_mut() {
                    map.insert("device_id".into(), Value::from(device_id));
                }
                serde_json::json!({
                    "method": message.method(),
                    "dialog_id": dialog_id,
                    "body": body,
                })
            }
        };
        Ok(serde_json::to_string(&framed)?)
    }

    /// Strip the variant framing from an inbound message and decode it
    pub fn parse(&self, text: &str) -> Result<IncomingMessage> {
        let value: Value = serde_json::from_str(text)?;
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("message without method".into()))?
            .to_string();
        let body = match self {
            ProtocolVariant::Flat => &value,
            // Some dialog-backend messages (pong, close) arrive unwrapped
            ProtocolVariant::Dialog => value.get("body").unwrap_or(&value),
        };
        decode_payload(&method, body)
    }
}
