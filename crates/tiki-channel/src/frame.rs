//! Phoenix Channels V2 JSON frames.
//!
//! Every frame is a five-element array:
//!
//! ```text
//! [join_ref, ref, topic, event, payload]
//! ```
//!
//! - requests carry a fresh `ref`; `join_ref` is the topic's join reference
//! - replies use event `phx_reply` and payload `{status, response}`
//! - pushes carry `ref = null`
//!
//! References are sent as decimal strings (as the Phoenix JavaScript client
//! does) and accepted as strings or numbers.

use std::fmt;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ChannelError;

/// Join request event.
pub const PHX_JOIN: &str = "phx_join";
/// Reply event.
pub const PHX_REPLY: &str = "phx_reply";
/// Leave request event.
pub const PHX_LEAVE: &str = "phx_leave";
/// Server-initiated close of a topic.
pub const PHX_CLOSE: &str = "phx_close";
/// Server-side crash of a topic's channel process.
pub const PHX_ERROR: &str = "phx_error";
/// Liveness event.
pub const HEARTBEAT: &str = "heartbeat";
/// Topic reserved for socket-level traffic such as heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Per-request correlation id, unique within one multiplexer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference(u64);

impl Reference {
    /// Wrap a raw reference number.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw reference number.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One wire frame, inbound or outbound.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Join reference of the topic the frame belongs to.
    pub join_ref: Option<Reference>,
    /// Request reference; `None` for pushes.
    pub reference: Option<Reference>,
    /// Topic name.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: Value,
}

impl Frame {
    /// Build an outbound request frame.
    pub fn request(
        join_ref: Option<Reference>,
        reference: Reference,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            join_ref,
            reference: Some(reference),
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Serialize to the JSON array text sent over the socket.
    pub fn encode(&self) -> String {
        json!([
            self.join_ref.map(|r| r.to_string()),
            self.reference.map(|r| r.to_string()),
            self.topic,
            self.event,
            self.payload,
        ])
        .to_string()
    }

    /// Parse a frame received from the socket.
    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ChannelError::Protocol(format!("invalid JSON: {e}")))?;
        let Value::Array(parts) = value else {
            return Err(ChannelError::Protocol("frame is not an array".into()));
        };
        let [join_ref, reference, topic, event, payload]: [Value; 5] =
            parts.try_into().map_err(|parts: Vec<Value>| {
                ChannelError::Protocol(format!(
                    "expected 5 frame elements, got {}",
                    parts.len()
                ))
            })?;

        let Value::String(topic) = topic else {
            return Err(ChannelError::Protocol("topic is not a string".into()));
        };
        let Value::String(event) = event else {
            return Err(ChannelError::Protocol("event is not a string".into()));
        };

        Ok(Self {
            join_ref: parse_reference(join_ref, "join_ref")?,
            reference: parse_reference(reference, "ref")?,
            topic,
            event,
            payload,
        })
    }

    /// Whether this frame answers a request.
    pub fn is_reply(&self) -> bool {
        self.event == PHX_REPLY
    }
}

fn parse_reference(value: Value, field: &str) -> Result<Option<Reference>, ChannelError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => s
            .parse::<u64>()
            .map(|n| Some(Reference(n)))
            .map_err(|_| ChannelError::Protocol(format!("{field} '{s}' is not numeric"))),
        Value::Number(n) => n
            .as_u64()
            .map(|n| Some(Reference(n)))
            .ok_or_else(|| ChannelError::Protocol(format!("{field} {n} is not a u64"))),
        other => Err(ChannelError::Protocol(format!(
            "{field} has unexpected type: {other}"
        ))),
    }
}

/// Payload of a `phx_reply` frame.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Reply {
    /// `"ok"`, `"error"`, or another server-defined status.
    pub status: String,
    /// Response body.
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    /// Parse the payload of a reply frame.
    pub fn from_payload(payload: Value) -> Result<Self, ChannelError> {
        serde_json::from_value(payload)
            .map_err(|e| ChannelError::Protocol(format!("malformed reply payload: {e}")))
    }

    /// Whether the server accepted the request.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// An unsolicited server push delivered to handlers.
#[derive(Clone, Debug, PartialEq)]
pub struct Push {
    /// Topic the push arrived on.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: Value,
}
