//! Periodic liveness signaling.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::Inner;

/// Send a heartbeat every `interval` until `cancel` fires or the multiplexer
/// is dropped.
///
/// The first heartbeat goes out one full interval after connecting. A
/// heartbeat still unanswered at the next tick closes the connection (see
/// [`Inner::heartbeat_tick`]).
pub(super) async fn run_heartbeat(inner: Weak<Inner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.heartbeat_tick();
            }
        }
    }
}
