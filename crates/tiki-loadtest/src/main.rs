//! # tiki-loadtest
//!
//! Drives concurrent virtual users against a Phoenix LiveView page. Each
//! iteration bootstraps a session, joins, sends one event, waits for its
//! reply and leaves. Exits non-zero when the failure rate exceeds the
//! configured threshold.

#![deny(unsafe_code)]

mod runner;
mod scenario;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tiki_core::logging::{LogFormat, init_subscriber};
use tiki_settings::LoadTestSettings;
use tracing::{error, info};

use crate::scenario::Scenario;

/// LiveView load-test runner.
#[derive(Parser, Debug)]
#[command(name = "tiki-loadtest", about = "Drive virtual users against a Phoenix LiveView page")]
struct Cli {
    /// Settings file (default: `$TIKI_SETTINGS` or `./loadtest.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Page URL to bootstrap from.
    #[arg(long)]
    url: Option<String>,

    /// Channel socket URL.
    #[arg(long)]
    socket_url: Option<String>,

    /// Session cookie value sent under the configured cookie name.
    #[arg(long)]
    cookie: Option<String>,

    /// Concurrent virtual users.
    #[arg(long)]
    vus: Option<usize>,

    /// Run time in seconds.
    #[arg(long)]
    duration: Option<u64>,

    /// Log filter when `RUST_LOG` is unset.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Flags override every other settings layer.
    fn apply(&self, settings: &mut LoadTestSettings) {
        if let Some(url) = &self.url {
            settings.target.url.clone_from(url);
        }
        if let Some(socket_url) = &self.socket_url {
            settings.target.socket_url.clone_from(socket_url);
        }
        if let Some(cookie) = &self.cookie {
            settings.target.cookie = Some(cookie.clone());
        }
        if let Some(vus) = self.vus {
            settings.scenario.virtual_users = vus;
        }
        if let Some(duration) = self.duration {
            settings.scenario.duration_secs = duration;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.format = LogFormat::Json;
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(tiki_settings::settings_path);
    let mut settings = tiki_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    init_subscriber(&settings.logging.level, settings.logging.format);

    let scenario = Scenario::from_settings(&settings).context("Invalid target")?;
    let vus = settings.scenario.virtual_users;
    let duration = Duration::from_secs(settings.scenario.duration_secs);
    info!(
        url = %scenario.endpoint.url(),
        socket_url = %scenario.endpoint.socket_url(),
        vus,
        duration_secs = duration.as_secs(),
        "starting load test"
    );

    let summary = runner::run(Arc::new(scenario), vus, duration).await;
    let max = settings.scenario.max_failure_rate;
    if summary.passed(max) {
        info!(
            iterations = summary.iterations,
            failures = summary.failures,
            failure_rate = summary.failure_rate(),
            "load test passed"
        );
        Ok(ExitCode::SUCCESS)
    } else {
        error!(
            iterations = summary.iterations,
            failures = summary.failures,
            failure_rate = summary.failure_rate(),
            max_failure_rate = max,
            "load test failed"
        );
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_settings() {
        let cli = Cli::parse_from([
            "tiki-loadtest",
            "--url",
            "https://tickets.example/events/2/purchase",
            "--vus",
            "10",
            "--duration",
            "5",
            "--cookie",
            "abc",
            "--json-logs",
        ]);
        let mut settings = LoadTestSettings::default();
        cli.apply(&mut settings);

        assert_eq!(settings.target.url, "https://tickets.example/events/2/purchase");
        assert_eq!(settings.target.socket_url, "ws://localhost:4000/live/websocket");
        assert_eq!(settings.target.cookie.as_deref(), Some("abc"));
        assert_eq!(settings.scenario.virtual_users, 10);
        assert_eq!(settings.scenario.duration_secs, 5);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn absent_flags_leave_settings_alone() {
        let cli = Cli::parse_from(["tiki-loadtest"]);
        let mut settings = LoadTestSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.scenario.virtual_users, 500);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn zero_vus_from_flags_fails_validation() {
        let cli = Cli::parse_from(["tiki-loadtest", "--vus", "0"]);
        let mut settings = LoadTestSettings::default();
        cli.apply(&mut settings);
        assert!(settings.validate().is_err());
    }
}
