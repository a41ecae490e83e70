//! # tiki-channel
//!
//! Client side of the Phoenix Channels V2 protocol.
//!
//! - [`transport`]: one WebSocket, an ordered outbound queue and an inbound
//!   event stream
//! - [`frame`]: the `[join_ref, ref, topic, event, payload]` codec
//! - [`multiplexer`]: topics, reference allocation, reply correlation,
//!   heartbeats and per-topic timers over one transport
//!
//! ```text
//! Multiplexer::join ──► phx_join ──► Transport ──► server
//!        ▲                                           │
//!   PendingReply ◄── dispatch loop ◄── phx_reply ◄───┘
//! ```

#![deny(unsafe_code)]

pub mod error;
pub mod frame;
pub mod multiplexer;
pub mod transport;

pub use error::ChannelError;
pub use frame::{
    Frame, HEARTBEAT, PHOENIX_TOPIC, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE, PHX_REPLY, Push,
    Reference, Reply,
};
pub use multiplexer::{Multiplexer, MultiplexerConfig, PendingReply, PushHandler, TimerId};
pub use transport::{Outbound, Transport, TransportEvent, TransportSender};
