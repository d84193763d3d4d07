//! Persistent task scheduler.
//!
//! Clients register [`Task`]s with a [`Scheduler`]; the scheduler publishes
//! [`SchedulerEvent`]s when tasks fall due, expire or change. Tasks flagged
//! with `wakeup_system` can bring the machine out of suspend through a
//! [`WaitableTimer`].

pub mod collection;
pub mod events;
pub mod runner;
pub mod store;
pub mod task;
pub mod timer;

pub use collection::TaskCollection;
pub use events::{PowerEvent, SchedulerEvent, SchedulerEventKind};
pub use runner::{Scheduler, TimerFactory};
pub use store::{JsonFileStore, MemoryStore, SchedulerState, SchedulerStore};
pub use task::{Occurrence, Schedule, Task, TaskId};
pub use timer::{ExpiryHandler, TimerClock, WaitableTimer, WakeTimer};
