//! What each virtual user does, built from settings.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tiki_liveview::{Endpoint, EndpointError, SessionConfig};
use tiki_settings::LoadTestSettings;

/// One iteration's recipe, shared read-only by every virtual user.
#[derive(Clone, Debug)]
pub struct Scenario {
    /// The LiveView under test.
    pub endpoint: Arc<Endpoint>,
    /// Timing of each session.
    pub session: SessionConfig,
    /// Event sent once joined.
    pub event: String,
    /// Payload of that event.
    pub payload: Value,
    /// Pause between iterations of one virtual user.
    pub think_time: Duration,
}

impl Scenario {
    /// Build from validated settings.
    pub fn from_settings(settings: &LoadTestSettings) -> Result<Self, EndpointError> {
        let target = &settings.target;
        let mut endpoint = Endpoint::new(&target.url, &target.socket_url)?;
        for (name, value) in &target.params {
            endpoint = endpoint.with_param(name, value);
        }
        for (name, value) in &target.headers {
            endpoint = endpoint.with_header(name, value);
        }
        if let Some(cookie) = &target.cookie {
            endpoint = endpoint.with_cookie(&target.cookie_name, cookie);
        }

        let channel = &settings.channel;
        Ok(Self {
            endpoint: Arc::new(endpoint),
            session: SessionConfig {
                heartbeat_interval: Duration::from_millis(channel.heartbeat_interval_ms),
                bootstrap_timeout: Duration::from_millis(channel.bootstrap_timeout_ms),
                connect_timeout: Duration::from_millis(channel.connect_timeout_ms),
                join_timeout: Duration::from_millis(channel.join_timeout_ms),
                request_timeout: Duration::from_millis(channel.request_timeout_ms),
            },
            event: settings.scenario.event.clone(),
            payload: settings.scenario.payload.clone(),
            think_time: Duration::from_millis(settings.scenario.think_time_ms),
        })
    }
}
