//! LiveView session client.
//!
//! A [`LiveSession`] walks `Idle → Bootstrapping → Connecting → Joining →
//! Joined → Left` exactly once. Any failure on the way lands in `Failed`,
//! and so does a joined session whose connection later drops.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tiki_channel::{
    ChannelError, Multiplexer, MultiplexerConfig, PendingReply, Push, TimerId,
};
use tracing::{debug, info, warn};

use crate::bootstrap::Bootstrap;
use crate::endpoint::Endpoint;
use crate::error::SessionError;

/// Where a session is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet connected.
    Idle,
    /// Fetching the page.
    Bootstrapping,
    /// Opening the socket.
    Connecting,
    /// Join sent, awaiting the reply.
    Joining,
    /// Joined; events may be sent.
    Joined,
    /// Left by the caller.
    Left,
    /// Bootstrap, connection, or join failed, or the connection dropped.
    Failed,
}

impl SessionState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Left | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Bootstrapping => "bootstrapping",
            Self::Connecting => "connecting",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Left => "left",
            Self::Failed => "failed",
        })
    }
}

/// Session timing.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Heartbeat period of the session's connection.
    pub heartbeat_interval: Duration,
    /// Bound on the page GET.
    pub bootstrap_timeout: Duration,
    /// Bound on opening the socket.
    pub connect_timeout: Duration,
    /// Bound on the join reply.
    pub join_timeout: Duration,
    /// Bound used by [`LiveSession::call`].
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            bootstrap_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// One simulated browser tab on a LiveView.
pub struct LiveSession {
    endpoint: Arc<Endpoint>,
    bootstrap: Bootstrap,
    config: SessionConfig,
    state: SessionState,
    topic: Option<String>,
    mux: Option<Multiplexer>,
}

impl LiveSession {
    /// A session on `endpoint`, with its own HTTP client.
    pub fn new(endpoint: Arc<Endpoint>, config: SessionConfig) -> Self {
        let bootstrap = Bootstrap::new(config.bootstrap_timeout);
        Self::with_bootstrap(endpoint, bootstrap, config)
    }

    /// A session that bootstraps through `bootstrap`.
    pub fn with_bootstrap(endpoint: Arc<Endpoint>, bootstrap: Bootstrap, config: SessionConfig) -> Self {
        Self {
            endpoint,
            bootstrap,
            config,
            state: SessionState::Idle,
            topic: None,
            mux: None,
        }
    }

    /// Current state. A joined session reports [`SessionState::Failed`] once
    /// its connection closes or the server closes or errors its topic.
    pub fn state(&self) -> SessionState {
        match (&self.state, &self.mux, &self.topic) {
            (SessionState::Joined, Some(mux), Some(topic))
                if mux.is_closed() || !mux.is_joined(topic) =>
            {
                SessionState::Failed
            }
            (state, ..) => *state,
        }
    }

    /// The LiveView topic, once known.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Bootstrap, open the socket and join the LiveView.
    ///
    /// Resolves with the join response (the initial render) once joined.
    pub async fn connect(&mut self) -> Result<Value, SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                operation: "connect",
                state: self.state(),
            });
        }

        self.state = SessionState::Bootstrapping;
        let tokens = match self.bootstrap.fetch(&self.endpoint).await {
            Ok(tokens) => tokens,
            Err(err) => return Err(self.fail(err)),
        };
        let topic = tokens.topic();
        self.topic = Some(topic.clone());

        self.state = SessionState::Connecting;
        let socket_url = self.endpoint.socket_url_for(&tokens.csrf_token);
        let headers = self.endpoint.socket_headers(&tokens.cookies);
        let config = MultiplexerConfig {
            heartbeat_interval: self.config.heartbeat_interval,
            connect_timeout: self.config.connect_timeout,
        };
        let mux = match Multiplexer::connect(&socket_url, &headers, config).await {
            Ok(mux) => mux,
            Err(err) => return Err(self.fail(err)),
        };
        debug!(%socket_url, %topic, "socket connected");

        self.state = SessionState::Joining;
        let payload = tokens.join_payload(self.endpoint.page_url().as_str());
        let reply = mux.join(topic.clone(), payload);
        self.mux = Some(mux);

        match reply.timeout(self.config.join_timeout).await {
            Ok(response) => {
                self.state = SessionState::Joined;
                info!(%topic, "session joined");
                Ok(response)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Send `event` on the LiveView topic.
    ///
    /// Resolves immediately to [`ChannelError::NotJoined`] unless joined.
    pub fn send(&self, event: impl Into<String>, payload: Value) -> PendingReply {
        match (&self.mux, &self.topic) {
            (Some(mux), Some(topic)) if self.state == SessionState::Joined => {
                mux.send(topic, event, payload)
            }
            _ => PendingReply::failed(ChannelError::NotJoined {
                topic: self.topic.clone().unwrap_or_default(),
            }),
        }
    }

    /// Send `event` and wait for its reply, bounded by the request timeout.
    pub async fn call(&self, event: impl Into<String>, payload: Value) -> Result<Value, SessionError> {
        let reply = self.send(event, payload);
        Ok(reply.timeout(self.config.request_timeout).await?)
    }

    /// Register a handler for server pushes of `event`.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> Result<(), SessionError>
    where
        F: Fn(&Push) + Send + Sync + 'static,
    {
        let (mux, topic) = self.channel("subscribe")?;
        Ok(mux.on(topic, event, handler)?)
    }

    /// Run `callback` every `period` while joined.
    pub fn set_interval<F>(&self, period: Duration, callback: F) -> Result<TimerId, SessionError>
    where
        F: FnMut() + Send + 'static,
    {
        let (mux, topic) = self.channel("schedule on")?;
        Ok(mux.set_interval(topic, period, callback)?)
    }

    /// Run `callback` once after `delay` unless the session leaves first.
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> Result<TimerId, SessionError>
    where
        F: FnOnce() + Send + 'static,
    {
        let (mux, topic) = self.channel("schedule on")?;
        Ok(mux.set_timeout(topic, delay, callback)?)
    }

    /// Cancel a callback scheduled on this session.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.mux.as_ref().is_some_and(|mux| mux.cancel_timer(id))
    }

    /// Leave the LiveView and close the connection.
    ///
    /// Returns `false`, doing nothing, unless the session is joined.
    pub fn leave(&mut self) -> bool {
        if self.state() != SessionState::Joined {
            return false;
        }
        let left = match (&self.mux, &self.topic) {
            (Some(mux), Some(topic)) => mux.leave(topic),
            _ => false,
        };
        self.state = SessionState::Left;
        self.mux = None;
        left
    }

    fn channel(&self, operation: &'static str) -> Result<(&Multiplexer, &str), SessionError> {
        match (&self.mux, &self.topic) {
            (Some(mux), Some(topic)) if self.state() == SessionState::Joined => Ok((mux, topic.as_str())),
            _ => Err(SessionError::InvalidState {
                operation,
                state: self.state(),
            }),
        }
    }

    fn fail(&mut self, err: impl Into<SessionError>) -> SessionError {
        let err = err.into();
        warn!(state = %self.state, error = %err, "session failed");
        self.state = SessionState::Failed;
        if let Some(mux) = self.mux.take() {
            mux.close();
        }
        err
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if let Some(mux) = self.mux.take() {
            mux.close();
        }
    }
}

impl fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSession")
            .field("url", &self.endpoint.url().as_str())
            .field("state", &self.state())
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
