//! wakesched: a persistent task scheduler that survives suspend and resume.
//!
//! Components register tasks that run once, repeat on an interval or a
//! wall-clock pattern, or fire at every startup or wake-up. The scheduler
//! polls for due work, persists its state, and before the system suspends
//! arms an OS wake timer for the soonest task allowed to wake the machine.
//!
//! # Architecture
//!
//! - **Task model**: [`scheduler::task`] defines tasks and their schedules
//! - **Collection**: [`scheduler::collection`] keeps tasks ordered by next run
//! - **Wake timer**: [`scheduler::timer`] wraps `timerfd` on Linux
//! - **Orchestrator**: [`scheduler::runner`] owns the poll loop and reacts to
//!   power events
//! - **Persistence**: [`scheduler::store`] saves state as JSON

pub mod config;
pub mod dirs;
pub mod error;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError, TimerError};
pub use scheduler::{
    JsonFileStore, MemoryStore, Occurrence, PowerEvent, Schedule, Scheduler, SchedulerEvent,
    SchedulerEventKind, SchedulerState, SchedulerStore, Task, TaskCollection, TaskId, TimerClock,
    WaitableTimer, WakeTimer,
};
