//! Application directory paths.
//!
//! Uses the [`dirs`](::dirs) crate for platform-appropriate locations.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Config + state | `~/Library/Application Support/wakesched/` | `~/.config/wakesched/` |
//! | Data + logs | `~/Library/Application Support/wakesched/` | `~/.local/share/wakesched/` |
//!
//! # Environment Overrides
//!
//! - `WAKESCHED_CONFIG_DIR` overrides [`config_dir`]
//! - `WAKESCHED_DATA_DIR` overrides [`data_dir`]

use std::path::PathBuf;

/// Application config directory; holds `config.toml` and `scheduler.json`.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("WAKESCHED_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    ::dirs::config_dir()
        .map(|d| d.join("wakesched"))
        .unwrap_or_else(|| PathBuf::from("/tmp/wakesched-config"))
}

/// Application data directory.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("WAKESCHED_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    ::dirs::data_dir()
        .map(|d| d.join("wakesched"))
        .unwrap_or_else(|| PathBuf::from("/tmp/wakesched-data"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Scheduler state file path (`config_dir()/scheduler.json`).
#[must_use]
pub fn state_file() -> PathBuf {
    config_dir().join("scheduler.json")
}
