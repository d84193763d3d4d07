//! Ordered task container.
//!
//! [`TaskCollection`] keeps tasks sorted ascending by `next_run` across
//! every `add`/`remove`/`replace` and guarantees id uniqueness. Lookups
//! return owned clones so callers never hold references into the
//! scheduler's authoritative state.

use crate::error::{Result, SchedulerError};
use crate::scheduler::task::{Task, TaskId};

/// Tasks sorted by next run, unique by id.
#[derive(Debug, Clone, Default)]
pub struct TaskCollection {
    tasks: Vec<Task>,
}

impl TaskCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection from loaded tasks. Later duplicates of an id are
    /// dropped with a warning.
    #[must_use]
    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        let mut collection = Self::new();
        for task in tasks {
            let id = task.id;
            if let Err(e) = collection.add(task) {
                tracing::warn!(task_id = %id, "dropping persisted task: {e}");
            }
        }
        collection
    }

    /// Insert a task, keeping the sort order.
    ///
    /// Fails with [`SchedulerError::DuplicateTask`] and leaves the
    /// collection untouched when the id is already present.
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.contains(task.id) {
            return Err(SchedulerError::DuplicateTask(task.id));
        }
        // Insert after any equal-ranked entries.
        let index = self.tasks.partition_point(|t| t.next_run <= task.next_run);
        self.tasks.insert(index, task);
        Ok(())
    }

    /// Remove every entry carrying `id`. Returns the removed task, if any.
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let mut removed = None;
        self.tasks.retain(|task| {
            if task.id == id {
                if removed.is_none() {
                    removed = Some(task.clone());
                }
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove the entry with `id` (if present) and add `task` in its place.
    ///
    /// Returns the replaced task. Nothing changes when `task` would collide
    /// with a different existing id.
    pub fn replace(&mut self, id: TaskId, task: Task) -> Result<Option<Task>> {
        if task.id != id && self.contains(task.id) {
            return Err(SchedulerError::DuplicateTask(task.id));
        }
        let previous = self.remove(id);
        self.add(task)?;
        Ok(previous)
    }

    /// Full re-sort by `next_run`. Needed after in-place mutation through
    /// [`TaskCollection::get_mut`].
    pub fn sort(&mut self) {
        self.tasks.sort_by_key(|task| task.next_run);
    }

    /// Clone of the task with `id`.
    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.iter().find(|task| task.id == id).cloned()
    }

    /// Clones of all tasks registered by `owner`, in collection order.
    #[must_use]
    pub fn get_by_owner(&self, owner: &str) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|task| task.owner == owner)
            .cloned()
            .collect()
    }

    /// Mutable access for the scheduler. Callers must [`sort`](Self::sort)
    /// afterwards if `next_run` changed.
    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// Returns `true` when a task with `id` is present.
    #[must_use]
    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.iter().any(|task| task.id == id)
    }

    /// Iterate tasks in `next_run` order.
    pub fn iter(&self) -> std::slice::Iter<'_, Task> {
        self.tasks.iter()
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Owned copy of all tasks, in `next_run` order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Task> {
        self.tasks.clone()
    }
}

impl<'a> IntoIterator for &'a TaskCollection {
    type Item = &'a Task;
    type IntoIter = std::slice::Iter<'a, Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
