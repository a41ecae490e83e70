//! LiveView error types.

use thiserror::Error;
use tiki_channel::ChannelError;

use crate::session::SessionState;

/// An endpoint URL that cannot be used.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Not a parseable URL.
    #[error("invalid {field} '{value}': {reason}")]
    InvalidUrl {
        /// `url` or `socket_url`.
        field: &'static str,
        /// The rejected input.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// Parseable, but with the wrong scheme.
    #[error("{field} must use {expected}, got '{scheme}'")]
    Scheme {
        /// `url` or `socket_url`.
        field: &'static str,
        /// Accepted schemes.
        expected: &'static str,
        /// Scheme found.
        scheme: String,
    },
}

/// Failure to obtain session tokens from the page.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The GET could not be completed (connect, timeout, body read).
    #[error("bootstrap request to {url} failed: {source}")]
    Request {
        /// Page URL.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The page answered with a non-success status.
    #[error("bootstrap request to {url} returned HTTP {status}")]
    Status {
        /// Page URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// A required element is absent from the page.
    #[error("page has no element matching '{selector}'")]
    MissingElement {
        /// CSS selector that matched nothing.
        selector: &'static str,
    },

    /// A required attribute is absent from an element that was found.
    #[error("element '{selector}' has no '{attribute}' attribute")]
    MissingAttribute {
        /// CSS selector of the element.
        selector: &'static str,
        /// Attribute name.
        attribute: &'static str,
    },
}

/// Failure of a [`LiveSession`](crate::LiveSession) operation.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Bootstrap failed.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// Transport, join, or request failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The operation is not valid in the session's current state.
    #[error("cannot {operation} a session that is {state}")]
    InvalidState {
        /// What was attempted.
        operation: &'static str,
        /// State at the time.
        state: SessionState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_display() {
        let err = EndpointError::Scheme {
            field: "socket_url",
            expected: "ws or wss",
            scheme: "http".into(),
        };
        assert_eq!(err.to_string(), "socket_url must use ws or wss, got 'http'");
    }

    #[test]
    fn missing_attribute_display() {
        let err = BootstrapError::MissingAttribute {
            selector: "[data-phx-main]",
            attribute: "data-phx-session",
        };
        assert_eq!(
            err.to_string(),
            "element '[data-phx-main]' has no 'data-phx-session' attribute"
        );
    }

    #[test]
    fn session_error_wraps_channel_error_transparently() {
        let err = SessionError::from(ChannelError::NotJoined {
            topic: "lv:phx-F1".into(),
        });
        assert_eq!(err.to_string(), "topic 'lv:phx-F1' is not joined");
    }

    #[test]
    fn invalid_state_display() {
        let err = SessionError::InvalidState {
            operation: "connect",
            state: SessionState::Joined,
        };
        assert_eq!(err.to_string(), "cannot connect a session that is joined");
    }
}
