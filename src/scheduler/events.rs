//! Scheduler notifications and system power-state messages.

use crate::scheduler::task::Task;

/// Lifecycle notification published by the scheduler.
///
/// Every variant carries a snapshot of the task taken when the event was
/// raised; `Due` carries the task as it was before the firing updated it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// The task is due; subscribers perform the actual work.
    Due(Task),
    /// The task passed its expiry and is being dropped.
    Expired(Task),
    /// The task left the collection.
    Deleted(Task),
    /// The task was registered, replaced or rescheduled.
    Changed(Task),
}

/// Discriminant of a [`SchedulerEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerEventKind {
    Due,
    Expired,
    Deleted,
    Changed,
}

impl SchedulerEvent {
    /// Which kind of event this is.
    #[must_use]
    pub fn kind(&self) -> SchedulerEventKind {
        match self {
            Self::Due(_) => SchedulerEventKind::Due,
            Self::Expired(_) => SchedulerEventKind::Expired,
            Self::Deleted(_) => SchedulerEventKind::Deleted,
            Self::Changed(_) => SchedulerEventKind::Changed,
        }
    }

    /// The task snapshot carried by the event.
    #[must_use]
    pub fn task(&self) -> &Task {
        match self {
            Self::Due(task) | Self::Expired(task) | Self::Deleted(task) | Self::Changed(task) => {
                task
            }
        }
    }
}

/// System power-state transition delivered on the process message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    /// The system is about to suspend.
    Suspending,
    /// The system resumed from suspend.
    Resuming,
}
