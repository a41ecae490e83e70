//! Virtual users and the run loop.
//!
//! Each virtual user repeats one iteration (connect, send the scenario
//! event, leave) until the deadline, pausing for the think time in between.
//! A failed iteration is counted and logged, never fatal to the run.

use std::sync::Arc;
use std::time::Duration;

use tiki_liveview::{LiveSession, SessionError};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::scenario::Scenario;

/// Iteration counts of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Iterations started.
    pub iterations: u64,
    /// Iterations that ended in an error.
    pub failures: u64,
}

impl RunSummary {
    /// Share of failed iterations, `0.0` when nothing ran.
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_rate(&self) -> f64 {
        if self.iterations == 0 {
            0.0
        } else {
            self.failures as f64 / self.iterations as f64
        }
    }

    /// Whether the run stayed within `max_failure_rate`. A run without a
    /// single iteration never passes.
    pub fn passed(&self, max_failure_rate: f64) -> bool {
        self.iterations > 0 && self.failure_rate() <= max_failure_rate
    }

    fn record(&mut self, result: &Result<(), SessionError>) {
        self.iterations += 1;
        if result.is_err() {
            self.failures += 1;
        }
    }

    fn merge(&mut self, other: Self) {
        self.iterations += other.iterations;
        self.failures += other.failures;
    }
}

/// Run `virtual_users` concurrent users for `duration`.
pub async fn run(scenario: Arc<Scenario>, virtual_users: usize, duration: Duration) -> RunSummary {
    let deadline = Instant::now() + duration;
    let mut users = JoinSet::new();
    for vu in 1..=virtual_users {
        let scenario = Arc::clone(&scenario);
        let _ = users.spawn(virtual_user(vu, scenario, deadline));
    }

    let mut summary = RunSummary::default();
    while let Some(joined) = users.join_next().await {
        match joined {
            Ok(user) => summary.merge(user),
            Err(err) => warn!(error = %err, "virtual user task failed"),
        }
    }
    summary
}

async fn virtual_user(vu: usize, scenario: Arc<Scenario>, deadline: Instant) -> RunSummary {
    let mut summary = RunSummary::default();
    loop {
        let span = info_span!("iteration", vu, id = %Uuid::now_v7());
        let result = iteration(&scenario).instrument(span.clone()).await;
        if let Err(err) = &result {
            span.in_scope(|| warn!(error = %err, "iteration failed"));
        }
        summary.record(&result);

        if Instant::now() >= deadline {
            break;
        }
        time::sleep_until(deadline.min(Instant::now() + scenario.think_time)).await;
        if Instant::now() >= deadline {
            break;
        }
    }
    debug!(vu, iterations = summary.iterations, failures = summary.failures, "virtual user done");
    summary
}

/// One session: join, send the scenario event, wait for its reply, leave.
pub async fn iteration(scenario: &Scenario) -> Result<(), SessionError> {
    let mut session = LiveSession::new(Arc::clone(&scenario.endpoint), scenario.session.clone());
    let _ = session.connect().await?;
    let _ = session
        .call(scenario.event.clone(), scenario.payload.clone())
        .await?;
    let _ = session.leave();
    Ok(())
}
