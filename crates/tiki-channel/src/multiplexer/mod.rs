//! Topic multiplexer over one [`Transport`].
//!
//! [`Multiplexer`] is a cheap, cloneable handle. All state (the reference
//! counter, pending requests, topics, timers, the outstanding heartbeat)
//! lives in one [`Registry`] behind a mutex and is only touched through the
//! methods here.
//!
//! Two background tasks run per multiplexer:
//! - the dispatch loop, which decodes inbound frames, resolves replies by
//!   reference and hands pushes to topic handlers;
//! - the heartbeat loop.
//!
//! Both hold weak references, so dropping every handle tears the connection
//! down. Shutdown (explicit [`Multiplexer::close`], leaving the last topic, a
//! transport close, or a missed heartbeat) happens once and resolves every
//! outstanding request with [`ChannelError::ConnectionClosed`].

mod heartbeat;
mod registry;
mod reply;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::ChannelError;
use crate::frame::{
    Frame, HEARTBEAT, PHOENIX_TOPIC, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE, Push, Reference,
    Reply,
};
use crate::transport::{Transport, TransportEvent, TransportSender};

use registry::{Pending, Registry, RequestKind, TopicEntry};
pub use registry::{PushHandler, TimerId};
pub use reply::PendingReply;

/// Smallest timer period; zero would spin.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Multiplexer tuning.
#[derive(Clone, Debug)]
pub struct MultiplexerConfig {
    /// Period between heartbeats.
    pub heartbeat_interval: Duration,
    /// Upper bound on opening the socket, TCP connect and upgrade included.
    pub connect_timeout: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Handle to a multiplexed channel connection.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    registry: Mutex<Registry>,
    sender: TransportSender,
    shutdown: CancellationToken,
}

impl Multiplexer {
    /// Open a socket and start multiplexing over it.
    ///
    /// Fails with [`ChannelError::Connect`] if the upgrade has not completed
    /// within `config.connect_timeout`.
    pub async fn connect(
        url: &Url,
        headers: &[(String, String)],
        config: MultiplexerConfig,
    ) -> Result<Self, ChannelError> {
        let limit = config.connect_timeout.max(MIN_PERIOD);
        let transport = time::timeout(limit, Transport::connect(url, headers))
            .await
            .map_err(|_| ChannelError::Connect {
                url: url.to_string(),
                reason: format!("upgrade not completed within {}ms", limit.as_millis()),
            })??;
        Ok(Self::new(transport, config))
    }

    /// Start multiplexing over an established transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Transport, config: MultiplexerConfig) -> Self {
        let (sender, events) = transport.into_parts();
        let inner = Arc::new(Inner {
            registry: Mutex::new(Registry::new()),
            sender,
            shutdown: CancellationToken::new(),
        });

        drop(tokio::spawn(dispatch_loop(Arc::downgrade(&inner), events)));
        drop(tokio::spawn(heartbeat::run_heartbeat(
            Arc::downgrade(&inner),
            config.heartbeat_interval.max(MIN_PERIOD),
            inner.shutdown.clone(),
        )));

        Self { inner }
    }

    /// Join `topic`, sending `payload` with the join request.
    ///
    /// Resolves with the server's `response` on an `ok` reply, or
    /// [`ChannelError::JoinRejected`]. Never retried.
    pub fn join(&self, topic: impl Into<String>, payload: Value) -> PendingReply {
        let topic = topic.into();
        let mut registry = self.inner.registry.lock();
        if registry.closed {
            return PendingReply::failed(ChannelError::closed("multiplexer is closed"));
        }
        if registry.topics.contains_key(&topic) {
            return PendingReply::failed(ChannelError::AlreadyJoined { topic });
        }

        let reference = registry.allocate();
        let frame = Frame::request(Some(reference), reference, topic.clone(), PHX_JOIN, payload);
        if let Err(err) = self.inner.sender.send(frame.encode()) {
            return PendingReply::failed(err);
        }

        let (tx, rx) = oneshot::channel();
        let entry = TopicEntry::new(reference, self.inner.shutdown.child_token());
        let _ = registry.topics.insert(topic.clone(), entry);
        registry.insert_pending(reference, Pending::new(topic.clone(), RequestKind::Join, tx));
        drop(registry);

        debug!(%topic, %reference, "join sent");
        PendingReply::new(rx, reference, Arc::downgrade(&self.inner))
    }

    /// Send `event` on a joined topic.
    ///
    /// Resolves with the reply's `response`, or [`ChannelError::Rejected`] on
    /// an error status. Resolves immediately to [`ChannelError::NotJoined`],
    /// without touching the socket, when the topic is not joined.
    pub fn send(&self, topic: &str, event: impl Into<String>, payload: Value) -> PendingReply {
        let event = event.into();
        let mut registry = self.inner.registry.lock();
        if registry.closed {
            return PendingReply::failed(ChannelError::closed("multiplexer is closed"));
        }
        if !registry.is_joined(topic) {
            return PendingReply::failed(ChannelError::NotJoined {
                topic: topic.to_owned(),
            });
        }
        let join_ref = registry.topics.get(topic).map(|entry| entry.join_ref);

        let reference = registry.allocate();
        let frame = Frame::request(join_ref, reference, topic, event.clone(), payload);
        if let Err(err) = self.inner.sender.send(frame.encode()) {
            return PendingReply::failed(err);
        }

        let (tx, rx) = oneshot::channel();
        registry.insert_pending(
            reference,
            Pending::new(topic.to_owned(), RequestKind::Event(event), tx),
        );
        drop(registry);

        trace!(topic, %reference, "event sent");
        PendingReply::new(rx, reference, Arc::downgrade(&self.inner))
    }

    /// Leave `topic`.
    ///
    /// Sends `phx_leave`, resolves the topic's outstanding requests with
    /// [`ChannelError::Left`], cancels its timers, and closes the connection
    /// when no topics remain. Returns `false`, doing nothing, when the topic
    /// is not hosted here (already left, never joined, or closed).
    pub fn leave(&self, topic: &str) -> bool {
        let mut registry = self.inner.registry.lock();
        if registry.closed {
            return false;
        }
        let Some((entry, drained)) = registry.remove_topic(topic) else {
            return false;
        };

        let reference = registry.allocate();
        let frame = Frame::request(Some(entry.join_ref), reference, topic, PHX_LEAVE, json!({}));
        if self.inner.sender.send(frame.encode()).is_ok() {
            // Nobody waits on the leave reply; registering it keeps it from
            // being reported as unmatched.
            let (tx, _rx) = oneshot::channel();
            registry.insert_pending(reference, Pending::new(topic.to_owned(), RequestKind::Leave, tx));
        }
        let last = registry.topics.is_empty();
        drop(registry);

        info!(topic, abandoned = drained.len(), "left topic");
        for pending in drained {
            pending.resolve(Err(ChannelError::Left {
                topic: topic.to_owned(),
            }));
        }
        if last {
            self.inner.shutdown("last topic left");
        }
        true
    }

    /// Register a handler for pushes of `event` on `topic`.
    ///
    /// The topic must have been joined (or be joining).
    pub fn on<F>(&self, topic: &str, event: impl Into<String>, handler: F) -> Result<(), ChannelError>
    where
        F: Fn(&Push) + Send + Sync + 'static,
    {
        let mut registry = self.inner.registry.lock();
        let entry = registry
            .topics
            .get_mut(topic)
            .ok_or_else(|| ChannelError::NotJoined {
                topic: topic.to_owned(),
            })?;
        let handler: PushHandler = Arc::new(handler);
        entry.handlers.push((event.into(), handler));
        Ok(())
    }

    /// Run `callback` every `period` until the topic is left or the
    /// connection closes. The first run is one period from now.
    pub fn set_interval<F>(
        &self,
        topic: &str,
        period: Duration,
        mut callback: F,
    ) -> Result<TimerId, ChannelError>
    where
        F: FnMut() + Send + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let (id, token) = self.inner.register_timer(topic)?;

        drop(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => callback(),
                }
            }
        }));
        Ok(id)
    }

    /// Run `callback` once after `delay` unless the topic is left or the
    /// connection closes first.
    pub fn set_timeout<F>(&self, topic: &str, delay: Duration, callback: F) -> Result<TimerId, ChannelError>
    where
        F: FnOnce() + Send + 'static,
    {
        let (id, token) = self.inner.register_timer(topic)?;
        let owner = Arc::downgrade(&self.inner);
        let topic = topic.to_owned();

        drop(tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = time::sleep(delay) => {
                    if let Some(inner) = owner.upgrade() {
                        inner.registry.lock().forget_timer(&topic, id);
                    }
                    callback();
                }
            }
        }));
        Ok(id)
    }

    /// Cancel a scheduled callback. Returns `false` if it already finished or
    /// was cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.registry.lock().cancel_timer(id)
    }

    /// Close the connection, abandoning all outstanding requests.
    pub fn close(&self) {
        self.inner.shutdown("closed by client");
    }

    /// Whether the connection has shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.registry.lock().closed
    }

    /// Whether `topic` has been joined and not left.
    pub fn is_joined(&self, topic: &str) -> bool {
        self.inner.registry.lock().is_joined(topic)
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.registry.lock().pending_len()
    }

    /// Resolves once the connection has shut down.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }
}

impl Inner {
    fn register_timer(&self, topic: &str) -> Result<(TimerId, CancellationToken), ChannelError> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(ChannelError::closed("multiplexer is closed"));
        }
        let id = registry.allocate_timer();
        let entry = registry
            .topics
            .get_mut(topic)
            .ok_or_else(|| ChannelError::NotJoined {
                topic: topic.to_owned(),
            })?;
        let token = entry.cancel.child_token();
        let _ = entry.timers.insert(id, token.clone());
        Ok((id, token))
    }

    /// Drop a request the caller stopped waiting for.
    fn forget(&self, reference: Reference) {
        let mut registry = self.registry.lock();
        let Some(pending) = registry.take_pending(reference) else {
            return;
        };
        // A join nobody waits for any more leaves the topic half-open.
        if pending.kind == RequestKind::Join {
            let _ = registry.remove_topic(&pending.topic);
        }
        drop(registry);
        debug!(%reference, topic = %pending.topic, "forgot timed-out request");
    }

    /// Shut down once: abandon pending requests, cancel timers, close the socket.
    fn shutdown(&self, reason: &str) {
        let drained = {
            let mut registry = self.registry.lock();
            if registry.closed {
                return;
            }
            registry.close()
        };
        self.shutdown.cancel();
        self.sender.close();

        info!(reason, abandoned = drained.len(), "channel connection closed");
        for pending in drained {
            pending.resolve(Err(ChannelError::closed(reason)));
        }
    }

    fn heartbeat_tick(&self) {
        let mut registry = self.registry.lock();
        if registry.closed {
            return;
        }
        let outstanding = registry.heartbeat;
        if let Some(outstanding) = outstanding {
            drop(registry);
            warn!(reference = %outstanding, "heartbeat unanswered, closing connection");
            self.shutdown("heartbeat timeout");
            return;
        }

        let reference = registry.allocate();
        let frame = Frame::request(None, reference, PHOENIX_TOPIC, HEARTBEAT, json!({}));
        if self.sender.send(frame.encode()).is_ok() {
            registry.heartbeat = Some(reference);
            trace!(%reference, "heartbeat sent");
        }
    }

    fn dispatch(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "discarding malformed frame");
                return;
            }
        };
        if frame.is_reply() {
            self.dispatch_reply(frame);
        } else {
            self.dispatch_push(frame);
        }
    }

    fn dispatch_reply(&self, frame: Frame) {
        let Some(reference) = frame.reference else {
            warn!(topic = %frame.topic, "discarding reply without a reference");
            return;
        };

        let mut registry = self.registry.lock();
        if registry.heartbeat == Some(reference) {
            registry.heartbeat = None;
            trace!(%reference, "heartbeat acknowledged");
            return;
        }
        let Some(pending) = registry.take_pending(reference) else {
            drop(registry);
            warn!(%reference, topic = %frame.topic, "discarding reply with no pending request");
            return;
        };

        let outcome = Reply::from_payload(frame.payload);
        let mut abandoned = Vec::new();
        let result = match &pending.kind {
            RequestKind::Join => match outcome {
                Ok(reply) if reply.is_ok() => {
                    registry.mark_joined(&pending.topic);
                    Ok(reply.response)
                }
                other => {
                    if let Some((_, drained)) = registry.remove_topic(&pending.topic) {
                        abandoned = drained;
                    }
                    Err(match other {
                        Ok(reply) => ChannelError::JoinRejected {
                            topic: pending.topic.clone(),
                            reason: reply.response,
                        },
                        Err(err) => err,
                    })
                }
            },
            RequestKind::Event(event) => match outcome {
                Ok(reply) if reply.is_ok() => Ok(reply.response),
                Ok(reply) => Err(ChannelError::Rejected {
                    topic: pending.topic.clone(),
                    event: event.clone(),
                    reason: reply.response,
                }),
                Err(err) => Err(err),
            },
            RequestKind::Leave => outcome.map(|reply| reply.response),
        };
        drop(registry);

        let topic = &pending.topic;
        match (&pending.kind, &result) {
            (RequestKind::Join, Ok(_)) => info!(%topic, %reference, "joined"),
            (RequestKind::Join, Err(err)) => warn!(%topic, error = %err, "join failed"),
            _ => trace!(%topic, %reference, "reply received"),
        }
        for other in abandoned {
            other.resolve(Err(ChannelError::NotJoined {
                topic: topic.clone(),
            }));
        }
        pending.resolve(result);
    }

    fn dispatch_push(&self, frame: Frame) {
        let join_ref = frame.join_ref;
        let push = Push {
            topic: frame.topic,
            event: frame.event,
            payload: frame.payload,
        };

        let mut registry = self.registry.lock();
        let Some(entry) = registry.topics.get(&push.topic) else {
            drop(registry);
            debug!(topic = %push.topic, event = %push.event, "discarding push for unknown topic");
            return;
        };
        let handlers = entry.handlers_for(&push.event);
        let terminated = (push.event == PHX_CLOSE || push.event == PHX_ERROR)
            && join_ref.is_none_or(|r| r == entry.join_ref);
        let drained = if terminated {
            registry.remove_topic(&push.topic).map(|(_, drained)| drained)
        } else {
            None
        };
        drop(registry);

        for handler in handlers {
            handler(&push);
        }
        if let Some(drained) = drained {
            warn!(topic = %push.topic, event = %push.event, "topic terminated by server");
            for pending in drained {
                pending.resolve(Err(ChannelError::TopicClosed {
                    topic: push.topic.clone(),
                    event: push.event.clone(),
                }));
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Stops timers and the heartbeat once every handle is gone.
        self.shutdown.cancel();
    }
}

/// Route transport events until the socket closes or the multiplexer is dropped.
async fn dispatch_loop(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Message(text) => inner.dispatch(&text),
            TransportEvent::Error(reason) => warn!(%reason, "transport error"),
            TransportEvent::Closed { reason } => {
                inner.shutdown(&reason);
                return;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.shutdown("transport event stream ended");
    }
}
