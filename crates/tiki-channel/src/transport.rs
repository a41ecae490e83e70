//! WebSocket transport: a thin client over `tokio-tungstenite`.
//!
//! One [`Transport`] owns one socket. A single I/O task owns both halves of
//! the stream: it writes queued outbound frames in the order they were queued
//! and forwards inbound text frames as [`TransportEvent`]s. The event stream
//! always ends with exactly one [`TransportEvent::Closed`].

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use crate::error::ChannelError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something the socket reported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// An inbound text frame.
    Message(String),
    /// A non-fatal problem (e.g. an unsupported binary frame) or the error
    /// that is about to close the socket.
    Error(String),
    /// The socket is gone. Always the last event.
    Closed {
        /// Why it closed.
        reason: String,
    },
}

/// Work queued for the I/O task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Write one text frame.
    Frame(String),
    /// Send a close frame and stop.
    Close,
}

/// Cloneable handle for queueing outbound frames.
#[derive(Clone, Debug)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl TransportSender {
    /// Queue a text frame. Fails once the I/O task has stopped.
    pub fn send(&self, frame: String) -> Result<(), ChannelError> {
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| ChannelError::closed("transport stopped"))
    }

    /// Ask the I/O task to close the socket. No-op if already stopped.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    /// Whether the I/O task has stopped accepting frames.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A connected socket: an outbound queue plus the inbound event stream.
#[derive(Debug)]
pub struct Transport {
    sender: TransportSender,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Transport {
    /// Open a WebSocket to `url` with extra handshake headers.
    ///
    /// Exactly one connection attempt is made; retry policy belongs to the
    /// caller.
    pub async fn connect(url: &Url, headers: &[(String, String)]) -> Result<Self, ChannelError> {
        let connect_err = |reason: String| ChannelError::Connect {
            url: url.to_string(),
            reason,
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| connect_err(e.to_string()))?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| connect_err(format!("header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| connect_err(format!("header value for '{name}': {e}")))?;
            let _ = request.headers_mut().insert(name, value);
        }

        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        debug!(%url, status = response.status().as_u16(), "socket upgraded");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        drop(tokio::spawn(io_loop(ws, out_rx, event_tx)));

        Ok(Self::from_channels(out_tx, event_rx))
    }

    /// Build a transport over caller-owned channels.
    ///
    /// Whoever holds the other ends plays the socket: it receives
    /// [`Outbound`] work and must finish the event stream with
    /// [`TransportEvent::Closed`].
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<Outbound>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            sender: TransportSender { tx: outbound },
            events,
        }
    }

    /// A handle for queueing frames.
    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    /// Split into the outbound handle and the inbound event stream.
    pub fn into_parts(self) -> (TransportSender, mpsc::UnboundedReceiver<TransportEvent>) {
        (self.sender, self.events)
    }
}

/// Socket I/O loop.
///
/// Writes queued frames, forwards inbound text, and reports the close reason.
async fn io_loop(
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let reason = loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Frame(text)) => {
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break format!("write failed: {e}");
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    let _ = ws_tx.close().await;
                    break "closed by client".to_string();
                }
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    warn!(len = bytes.len(), "ignoring binary frame");
                    let _ = events.send(TransportEvent::Error("unsupported binary frame".into()));
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or_else(
                        || "closed by peer".to_string(),
                        |f| format!("closed by peer ({}): {}", u16::from(f.code), f.reason.as_str()),
                    );
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break format!("read failed: {e}");
                }
                None => break "stream ended".to_string(),
            },
        }
    };

    debug!(%reason, "socket closed");
    let _ = events.send(TransportEvent::Closed { reason });
}
