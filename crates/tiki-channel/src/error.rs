//! Channel error types.

use serde_json::Value;
use thiserror::Error;

use crate::frame::Reference;

/// Errors surfaced by the transport and the multiplexer.
///
/// Every pending request resolves to exactly one `Ok` reply or one of these.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The socket could not be established.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// The socket URL.
        url: String,
        /// Why the upgrade failed.
        reason: String,
    },

    /// The socket closed while the request was outstanding, or before it was sent.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Close reason reported by the transport.
        reason: String,
    },

    /// The server answered a join with a non-`ok` status.
    #[error("join rejected for topic '{topic}': {reason}")]
    JoinRejected {
        /// The topic that was refused.
        topic: String,
        /// The reply's `response` body.
        reason: Value,
    },

    /// The server answered an event with a non-`ok` status.
    #[error("'{event}' rejected on topic '{topic}': {reason}")]
    Rejected {
        /// The topic the event was sent on.
        topic: String,
        /// The event name.
        event: String,
        /// The reply's `response` body.
        reason: Value,
    },

    /// An event was sent on a topic that is not joined.
    #[error("topic '{topic}' is not joined")]
    NotJoined {
        /// The topic.
        topic: String,
    },

    /// A join was requested for a topic that is already joining or joined.
    #[error("topic '{topic}' is already joined")]
    AlreadyJoined {
        /// The topic.
        topic: String,
    },

    /// The topic was left locally before the reply arrived.
    #[error("left topic '{topic}' before a reply arrived")]
    Left {
        /// The topic.
        topic: String,
    },

    /// The server closed or crashed the topic (`phx_close` / `phx_error`).
    #[error("topic '{topic}' terminated by server ({event})")]
    TopicClosed {
        /// The topic.
        topic: String,
        /// `phx_close` or `phx_error`.
        event: String,
    },

    /// No reply within the caller's bound.
    #[error("no reply for ref {reference} within {timeout_ms}ms")]
    Timeout {
        /// The request that timed out.
        reference: Reference,
        /// How long we waited.
        timeout_ms: u64,
    },

    /// A frame could not be decoded or routed.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ChannelError {
    /// Whether the error means the socket is gone.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::ConnectionClosed { .. })
    }

    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connect_display() {
        let err = ChannelError::Connect {
            url: "ws://localhost:4000/live/websocket".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to ws://localhost:4000/live/websocket: connection refused"
        );
        assert!(err.is_connection_error());
    }

    #[test]
    fn join_rejected_display_includes_reason() {
        let err = ChannelError::JoinRejected {
            topic: "lv:phx-ABC".into(),
            reason: json!({"reason": "stale"}),
        };
        let text = err.to_string();
        assert!(text.contains("lv:phx-ABC"));
        assert!(text.contains("stale"));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn timeout_display() {
        let err = ChannelError::Timeout {
            reference: Reference::new(12),
            timeout_ms: 5000,
        };
        assert_eq!(err.to_string(), "no reply for ref 12 within 5000ms");
    }

    #[test]
    fn closed_helper_builds_connection_closed() {
        let err = ChannelError::closed("heartbeat timeout");
        assert!(err.is_connection_error());
        assert_eq!(err.to_string(), "connection closed: heartbeat timeout");
    }
}
