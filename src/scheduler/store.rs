//! Scheduler state persistence.
//!
//! The scheduler talks to storage only through [`SchedulerStore`].
//! [`JsonFileStore`] persists to a JSON file (default
//! `<config dir>/scheduler.json`); [`MemoryStore`] keeps state in process.

use crate::error::{Result, SchedulerError};
use crate::scheduler::task::Task;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Current persisted schema version.
const STATE_VERSION: u8 = 1;

fn default_state_version() -> u8 {
    STATE_VERSION
}

/// Serializable form of the task collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Schema version.
    #[serde(default = "default_state_version")]
    pub version: u8,
    /// Registered tasks.
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl SchedulerState {
    /// State holding `tasks` at the current schema version.
    #[must_use]
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            version: STATE_VERSION,
            tasks,
        }
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Persistence port consumed by the scheduler.
pub trait SchedulerStore: Send + Sync {
    /// Load previously saved state. A store with nothing saved yet returns
    /// an empty state.
    fn load(&self) -> Result<SchedulerState>;

    /// Persist `state`, replacing whatever was saved before.
    fn save(&self, state: &SchedulerState) -> Result<()>;
}

/// JSON file store with atomic replace-on-write.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default location (`dirs::state_file()`).
    #[must_use]
    pub fn at_default_path() -> Self {
        Self::new(crate::dirs::state_file())
    }

    /// File this store reads and writes.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SchedulerStore for JsonFileStore {
    fn load(&self) -> Result<SchedulerState> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SchedulerState::new(Vec::new()));
            }
            Err(e) => {
                return Err(SchedulerError::Persistence(format!(
                    "cannot read state {}: {e}",
                    self.path.display()
                )));
            }
        };

        serde_json::from_slice(&bytes).map_err(|e| {
            SchedulerError::Persistence(format!("cannot parse state {}: {e}", self.path.display()))
        })
    }

    fn save(&self, state: &SchedulerState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SchedulerError::Persistence(format!("cannot create state dir: {e}"))
            })?;
        }

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| SchedulerError::Persistence(format!("cannot serialize state: {e}")))?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .map_err(|e| SchedulerError::Persistence(format!("cannot write state: {e}")))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| SchedulerError::Persistence(format!("cannot finalize state: {e}")))?;
        Ok(())
    }
}

/// In-process store; counts saves.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<SchedulerState>,
    saves: AtomicUsize,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `tasks`, as if saved by an earlier run.
    #[must_use]
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            state: Mutex::new(SchedulerState::new(tasks)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of successful saves so far.
    #[must_use]
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Copy of the last saved state.
    #[must_use]
    pub fn snapshot(&self) -> SchedulerState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SchedulerStore for MemoryStore {
    fn load(&self) -> Result<SchedulerState> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &SchedulerState) -> Result<()> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl<S: SchedulerStore + ?Sized> SchedulerStore for std::sync::Arc<S> {
    fn load(&self) -> Result<SchedulerState> {
        (**self).load()
    }

    fn save(&self, state: &SchedulerState) -> Result<()> {
        (**self).save(state)
    }
}
