//! The caller's side of one outstanding request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use super::Inner;
use crate::error::ChannelError;
use crate::frame::Reference;

/// Resolves exactly once with the reply to a `join` or `send`.
///
/// Returned immediately by the multiplexer; awaiting it never blocks the
/// socket. Requests that fail before reaching the transport (topic not
/// joined, connection closed) come back already resolved.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Value, ChannelError>>,
    reference: Option<Reference>,
    owner: Weak<Inner>,
}

impl PendingReply {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<Value, ChannelError>>,
        reference: Reference,
        owner: Weak<Inner>,
    ) -> Self {
        Self {
            rx,
            reference: Some(reference),
            owner,
        }
    }

    /// An already-resolved failure.
    pub fn failed(err: ChannelError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self {
            rx,
            reference: None,
            owner: Weak::new(),
        }
    }

    /// Reference of the request, if it reached the transport.
    pub fn reference(&self) -> Option<Reference> {
        self.reference
    }

    /// Wait at most `duration` for the reply.
    ///
    /// On expiry the request is forgotten locally (a late reply is then
    /// reported as unmatched) and [`ChannelError::Timeout`] is returned. The
    /// server may still process the request.
    pub async fn timeout(mut self, duration: Duration) -> Result<Value, ChannelError> {
        match tokio::time::timeout(duration, &mut self).await {
            Ok(result) => result,
            Err(_) => {
                let reference = self.reference.unwrap_or(Reference::new(0));
                if let Some(owner) = self.owner.upgrade() {
                    owner.forget(reference);
                }
                Err(ChannelError::Timeout {
                    reference,
                    timeout_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Value, ChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(ChannelError::closed("multiplexer dropped")))
        })
    }
}
