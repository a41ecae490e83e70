//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LoadTestSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tiki_core::logging::LogFormat;
use tracing::debug;

use crate::errors::Result;
use crate::types::LoadTestSettings;

/// File read when neither `--settings` nor `TIKI_SETTINGS` names one.
pub const DEFAULT_SETTINGS_FILE: &str = "loadtest.json";

/// Resolve the settings file path: `TIKI_SETTINGS`, else `./loadtest.json`.
pub fn settings_path() -> PathBuf {
    std::env::var("TIKI_SETTINGS")
        .ok()
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE), PathBuf::from)
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LoadTestSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LoadTestSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

/// Defaults with the file at `path` merged over them, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<LoadTestSettings> {
    let defaults = serde_json::to_value(LoadTestSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides read through `lookup`.
///
/// Invalid values are ignored with a warning, falling back to file/default.
/// `COOKIE` is honoured for compatibility with existing run scripts;
/// `TIKI_COOKIE` wins when both are set.
pub fn apply_env_overrides<F>(settings: &mut LoadTestSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Target ──────────────────────────────────────────────────────
    if let Some(v) = env.string("TIKI_URL") {
        settings.target.url = v;
    }
    if let Some(v) = env.string("TIKI_SOCKET_URL") {
        settings.target.socket_url = v;
    }
    if let Some(v) = env.string("TIKI_COOKIE").or_else(|| env.string("COOKIE")) {
        settings.target.cookie = Some(v);
    }

    // ── Channel ─────────────────────────────────────────────────────
    if let Some(v) = env.u64("TIKI_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.channel.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.u64("TIKI_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.channel.connect_timeout_ms = v;
    }
    if let Some(v) = env.u64("TIKI_REQUEST_TIMEOUT_MS", 100, 600_000) {
        settings.channel.request_timeout_ms = v;
    }

    // ── Scenario ────────────────────────────────────────────────────
    if let Some(v) = env.usize("TIKI_VUS", 1, 100_000) {
        settings.scenario.virtual_users = v;
    }
    if let Some(v) = env.u64("TIKI_DURATION_SECS", 1, 86_400) {
        settings.scenario.duration_secs = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TIKI_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("TIKI_LOG_FORMAT") {
        match LogFormat::parse(&v) {
            Some(format) => settings.logging.format = format,
            None => tracing::warn!(key = "TIKI_LOG_FORMAT", value = %v, "unknown log format, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = self.string(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
