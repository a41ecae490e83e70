//! # tiki-settings
//!
//! Configuration for the load-test runner, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`LoadTestSettings::default()`]
//! 2. **Settings file**: `TIKI_SETTINGS` or `./loadtest.json` (deep-merged)
//! 3. **Environment variables**: `TIKI_*` overrides (highest priority)
//!
//! Command-line flags are applied on top by the runner binary.
//!
//! Settings are loaded once and shared read-only (`Arc`) between virtual
//! users; nothing here is a process-wide singleton.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_file_layer, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::{
    ChannelSettings, LoadTestSettings, LoggingSettings, ScenarioSettings, TargetSettings,
};
