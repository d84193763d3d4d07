//! Scheduler configuration.

use crate::scheduler::timer::TimerClock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default period of the poll loop.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 20;

/// Default lateness after which a non-forced run counts as missed.
pub const DEFAULT_MISSED_RUN_TOLERANCE_SECS: u64 = 120;

/// Top-level scheduler configuration, loaded from `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between poll ticks.
    pub poll_interval_secs: u64,
    /// A due task lagging the clock by more than this is skipped unless it
    /// has `force_run` set.
    pub missed_run_tolerance_secs: u64,
    /// Where task state is persisted (None = platform default).
    pub state_path: Option<PathBuf>,
    /// Clock used by the wake timer.
    pub wake_clock: TimerClock,
    /// Also write logs to a daily-rotated file under the data directory.
    pub log_to_file: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            missed_run_tolerance_secs: DEFAULT_MISSED_RUN_TOLERANCE_SECS,
            state_path: None,
            wake_clock: TimerClock::default(),
            log_to_file: false,
        }
    }
}

impl SchedulerConfig {
    /// Poll period, never shorter than one second.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Missed-run tolerance as a signed delta for timestamp arithmetic.
    #[must_use]
    pub fn missed_run_tolerance(&self) -> chrono::TimeDelta {
        i64::try_from(self.missed_run_tolerance_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX)
    }

    /// Configured state path, or the platform default.
    #[must_use]
    pub fn resolved_state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(crate::dirs::state_file)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::SchedulerError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SchedulerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/config.toml`.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::dirs::config_file()
    }
}
