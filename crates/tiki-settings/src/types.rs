//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file only needs the keys it changes. Each type implements
//! [`Default`] with the values of the stock checkout scenario.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tiki_core::logging::LogFormat;
use url::Url;

use crate::errors::{Result, SettingsError};

/// Root settings type for the load-test runner.
///
/// ```json
/// {
///   "target": { "url": "http://localhost:4000/events/1/purchase" },
///   "scenario": { "virtualUsers": 50, "durationSecs": 10 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadTestSettings {
    /// The page and socket under test.
    pub target: TargetSettings,
    /// Channel protocol timing.
    pub channel: ChannelSettings,
    /// Virtual user scenario.
    pub scenario: ScenarioSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl LoadTestSettings {
    /// Reject settings the runner cannot work with.
    pub fn validate(&self) -> Result<()> {
        check_url(&self.target.url, &["http", "https"], "target.url")?;
        check_url(&self.target.socket_url, &["ws", "wss"], "target.socketUrl")?;
        if self.scenario.virtual_users == 0 {
            return Err(SettingsError::InvalidValue(
                "scenario.virtualUsers must be at least 1".into(),
            ));
        }
        if self.scenario.duration_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "scenario.durationSecs must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scenario.max_failure_rate) {
            return Err(SettingsError::InvalidValue(format!(
                "scenario.maxFailureRate must be within 0..=1, got {}",
                self.scenario.max_failure_rate
            )));
        }
        if self.channel.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "channel.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.scenario.event.is_empty() {
            return Err(SettingsError::InvalidValue(
                "scenario.event must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn check_url(raw: &str, schemes: &[&str], key: &str) -> Result<()> {
    let url = Url::parse(raw)
        .map_err(|e| SettingsError::InvalidValue(format!("{key}: {e} ({raw})")))?;
    if schemes.contains(&url.scheme()) {
        Ok(())
    } else {
        Err(SettingsError::InvalidValue(format!(
            "{key}: scheme must be one of {schemes:?}, got '{}'",
            url.scheme()
        )))
    }
}

/// The LiveView page under test.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetSettings {
    /// Page URL fetched to bootstrap each session.
    pub url: String,
    /// LiveView socket URL.
    pub socket_url: String,
    /// Name of the session cookie.
    pub cookie_name: String,
    /// Session cookie value, sent on both the page fetch and the socket upgrade.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Query parameters added to the page fetch.
    pub params: BTreeMap<String, String>,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:4000/events/1/purchase".to_string(),
            socket_url: "ws://localhost:4000/live/websocket".to_string(),
            cookie_name: "_tiki_key".to_string(),
            cookie: None,
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
        }
    }
}

/// Channel protocol timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSettings {
    /// Heartbeat period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Bound on the page fetch.
    pub bootstrap_timeout_ms: u64,
    /// Bound on the socket upgrade.
    pub connect_timeout_ms: u64,
    /// Bound on the join reply.
    pub join_timeout_ms: u64,
    /// Bound on each event reply.
    pub request_timeout_ms: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            bootstrap_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            join_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
        }
    }
}

/// What each virtual user does per iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScenarioSettings {
    /// Number of concurrent virtual users.
    pub virtual_users: usize,
    /// Total run time.
    pub duration_secs: u64,
    /// Pause between iterations of one virtual user.
    pub think_time_ms: u64,
    /// Event name sent after the join.
    pub event: String,
    /// Payload sent with `event`.
    pub payload: Value,
    /// Failure rate above which the run is reported as failed.
    pub max_failure_rate: f64,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            virtual_users: 500,
            duration_secs: 60,
            think_time_ms: 1000,
            event: "event".to_string(),
            payload: json!({
                "type": "click",
                "event": "inc",
                "value": { "id": 3 },
                "cid": 1
            }),
            max_failure_rate: 0.01,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
