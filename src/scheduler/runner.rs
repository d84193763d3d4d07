//! Scheduler orchestrator.
//!
//! [`Scheduler`] owns the [`TaskCollection`] and the wake timer. While
//! running it spawns one tokio task that polls for due and expired tasks on
//! a fixed interval and reacts to [`PowerEvent`]s from the host's message
//! bus. Every public operation and every background reaction takes the same
//! lock, so nothing observes a half-updated collection.
//!
//! The scheduler never executes task payloads: it publishes
//! [`SchedulerEvent`]s and subscribers do the work.

use crate::config::SchedulerConfig;
use crate::error::{Result, TimerError};
use crate::scheduler::collection::TaskCollection;
use crate::scheduler::events::{PowerEvent, SchedulerEvent};
use crate::scheduler::store::{SchedulerState, SchedulerStore};
use crate::scheduler::task::{Occurrence, Task, TaskId, floor_minute};
use crate::scheduler::timer::{ExpiryHandler, TimerClock, WaitableTimer, WakeTimer};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the notification channel per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates the wake timer at startup, wiring its expiry to `handler`.
pub type TimerFactory =
    Box<dyn Fn(ExpiryHandler) -> std::result::Result<Box<dyn WakeTimer>, TimerError> + Send + Sync>;

/// Collection plus the wake timer; always accessed under one lock.
struct Core {
    tasks: TaskCollection,
    wake_timer: Option<Box<dyn WakeTimer>>,
}

/// State shared between the public handle and the background loop.
struct Shared {
    core: Mutex<Core>,
    store: Box<dyn SchedulerStore>,
    events: broadcast::Sender<SchedulerEvent>,
    missed_run_tolerance: TimeDelta,
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Persistent task scheduler with suspend/resume awareness.
pub struct Scheduler {
    shared: Arc<Shared>,
    power_bus: broadcast::Sender<PowerEvent>,
    timer_factory: TimerFactory,
    wake: Arc<Notify>,
    poll_interval: Duration,
    running: Mutex<Option<RunningLoop>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("poll_interval", &self.poll_interval)
            .field("running", &self.is_running())
            .field("tasks", &self.task_count())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a stopped scheduler and load persisted tasks from `store`.
    ///
    /// A store that fails to load is treated as empty. Power-state messages
    /// are received by subscribing to `power_bus` on [`startup`](Self::startup).
    pub fn new(
        config: &SchedulerConfig,
        store: impl SchedulerStore + 'static,
        power_bus: broadcast::Sender<PowerEvent>,
    ) -> Self {
        let tasks = match store.load() {
            Ok(state) => TaskCollection::from_tasks(state.tasks),
            Err(e) => {
                warn!("cannot load scheduler state, starting empty: {e}");
                TaskCollection::new()
            }
        };
        debug!(tasks = tasks.len(), "scheduler state loaded");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                tasks,
                wake_timer: None,
            }),
            store: Box::new(store),
            events,
            missed_run_tolerance: config.missed_run_tolerance(),
        });

        Self {
            shared,
            power_bus,
            timer_factory: default_timer_factory(config.wake_clock),
            wake: Arc::new(Notify::new()),
            poll_interval: config.poll_interval(),
            running: Mutex::new(None),
        }
    }

    /// Replace how the wake timer is created at startup.
    #[must_use]
    pub fn with_timer_factory(mut self, factory: TimerFactory) -> Self {
        self.timer_factory = factory;
        self
    }

    /// Subscribe to task notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    /// Returns `true` between [`startup`](Self::startup) and
    /// [`shutdown`](Self::shutdown).
    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Number of registered tasks.
    pub fn task_count(&self) -> usize {
        self.shared.lock_core().tasks.len()
    }

    /// Register a new task and return its generated id.
    ///
    /// Any id carried by `task` is replaced.
    pub fn add_task(&self, mut task: Task) -> Result<TaskId> {
        task.validate()?;
        task.id = TaskId::generate();

        let mut core = self.shared.lock_core();
        core.tasks.add(task.clone())?;
        self.shared.persist(&core);
        info!(task_id = %task.id, owner = %task.owner, next_run = %task.next_run, "task registered");
        self.shared.publish(SchedulerEvent::Changed(task.clone()));
        Ok(task.id)
    }

    /// Replace the task with `id`; inserts when no such task exists.
    pub fn update_task(&self, id: TaskId, mut task: Task) -> Result<()> {
        task.validate()?;
        task.id = id;

        let mut core = self.shared.lock_core();
        core.tasks.replace(id, task.clone())?;
        self.shared.persist(&core);
        debug!(task_id = %id, "task updated");
        self.shared.publish(SchedulerEvent::Changed(task));
        Ok(())
    }

    /// Remove the task with `id`. Unknown ids are ignored.
    pub fn remove_task(&self, id: TaskId) {
        let mut core = self.shared.lock_core();
        let Some(removed) = core.tasks.remove(id) else {
            debug!(task_id = %id, "remove ignored, task not found");
            return;
        };
        self.shared.persist(&core);
        info!(task_id = %id, "task removed");
        self.shared.publish(SchedulerEvent::Deleted(removed));
    }

    /// Snapshot of the task with `id`.
    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.shared.lock_core().tasks.get(id)
    }

    /// Snapshots of all tasks registered by `owner`.
    pub fn get_tasks(&self, owner: &str) -> Vec<Task> {
        self.shared.lock_core().tasks.get_by_owner(owner)
    }

    /// Enter the running state.
    ///
    /// Creates the wake timer, fires every [`Occurrence::EveryStartup`]
    /// task, then spawns the poll loop. Must be called from within a Tokio
    /// runtime. Calling it while already running does nothing.
    pub fn startup(&self) {
        let mut running = lock(&self.running);
        if running.is_some() {
            warn!("scheduler already running");
            return;
        }

        let wake = Arc::clone(&self.wake);
        let timer = match (self.timer_factory)(Box::new(move || wake.notify_one())) {
            Ok(timer) => Some(timer),
            Err(e) => {
                warn!(os_code = ?e.os_code(), "wake timer unavailable, suspend will not wake the system: {e}");
                None
            }
        };
        self.shared.lock_core().wake_timer = timer;

        self.shared.run_occurrence(Occurrence::EveryStartup, Utc::now());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.shared),
            self.power_bus.subscribe(),
            Arc::clone(&self.wake),
            cancel.clone(),
            self.poll_interval,
        ));
        *running = Some(RunningLoop { cancel, handle });
        info!(
            tasks = self.task_count(),
            poll_secs = self.poll_interval.as_secs(),
            "scheduler started"
        );
    }

    /// Leave the running state.
    ///
    /// Stops the poll loop and waits for it to finish, releases the wake
    /// timer and persists state. Does nothing when already stopped.
    pub async fn shutdown(&self) {
        let Some(running) = lock(&self.running).take() else {
            debug!("scheduler already stopped");
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            error!("scheduler loop ended abnormally: {e}");
        }

        let mut core = self.shared.lock_core();
        if let Some(timer) = core.wake_timer.take() {
            if let Err(e) = timer.cancel() {
                warn!("failed to cancel wake timer: {e}");
            }
        }
        self.shared.persist(&core);
        info!("scheduler stopped");
    }

    /// Run one poll pass at the current time.
    pub fn tick(&self) {
        self.tick_at(Utc::now());
    }

    /// Run one poll pass as if the clock read `now`.
    pub fn tick_at(&self, now: DateTime<Utc>) {
        self.shared.poll_tick(now);
    }

    /// React to a power-state message at the current time.
    pub fn handle_power_event(&self, event: PowerEvent) {
        self.handle_power_event_at(event, Utc::now());
    }

    /// React to a power-state message as if the clock read `now`.
    pub fn handle_power_event_at(&self, event: PowerEvent, now: DateTime<Utc>) {
        self.shared.handle_power_event(event, now);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Without an awaited shutdown the loop is only told to stop.
        if let Some(running) = lock(&self.running).take() {
            running.cancel.cancel();
            debug!("scheduler dropped while running, poll loop cancelled");
        }
    }
}

impl Shared {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        lock(&self.core)
    }

    fn publish(&self, event: SchedulerEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn persist(&self, core: &Core) {
        let state = SchedulerState::new(core.tasks.to_vec());
        if let Err(e) = self.store.save(&state) {
            error!("cannot persist scheduler state: {e}");
        }
    }

    fn handle_power_event(&self, event: PowerEvent, now: DateTime<Utc>) {
        debug!(?event, "power event received");
        match event {
            PowerEvent::Resuming => self.run_occurrence(Occurrence::EveryWakeUp, now),
            PowerEvent::Suspending => self.arm_wake_timer(now),
        }
    }

    /// Fire (or expire) every task bound to `occurrence`.
    fn run_occurrence(&self, occurrence: Occurrence, now: DateTime<Utc>) {
        let mut core = self.lock_core();
        let ids: Vec<TaskId> = core
            .tasks
            .iter()
            .filter(|task| task.occurrence == occurrence)
            .map(|task| task.id)
            .collect();
        if ids.is_empty() {
            return;
        }

        for id in ids {
            let Some(task) = core.tasks.get(id) else {
                continue;
            };
            if task.is_expired(now) {
                self.expire_task(&mut core, task);
            } else {
                self.process_task(&mut core, task, now);
            }
        }

        core.tasks.sort();
        self.persist(&core);
    }

    /// One poll pass: expire, skip missed runs and fire due tasks.
    ///
    /// Every comparison in the pass uses `now` floored to the minute.
    fn poll_tick(&self, now: DateTime<Utc>) {
        let now = floor_minute(now);
        let mut core = self.lock_core();
        let ids: Vec<TaskId> = core.tasks.iter().map(|task| task.id).collect();
        let mut changed = false;

        for id in ids {
            let Some(task) = core.tasks.get(id) else {
                continue;
            };

            if task.is_expired(now) {
                self.expire_task(&mut core, task);
                changed = true;
                continue;
            }
            if !matches!(task.occurrence, Occurrence::Once | Occurrence::Repeat) {
                continue;
            }
            if !task.is_due(now) {
                continue;
            }
            if task.is_missed(now, self.missed_run_tolerance) && !task.force_run {
                self.skip_missed_task(&mut core, task, now);
            } else {
                self.process_task(&mut core, task, now);
            }
            changed = true;
        }

        if changed {
            core.tasks.sort();
            self.persist(&core);
        }
    }

    /// Publish `Due` for the pre-fire snapshot, then record the run.
    fn process_task(&self, core: &mut Core, task: Task, now: DateTime<Utc>) {
        let id = task.id;
        let once = task.occurrence == Occurrence::Once;
        info!(task_id = %id, owner = %task.owner, "task due");
        self.publish(SchedulerEvent::Due(task));

        if let Some(entry) = core.tasks.get_mut(id) {
            entry.mark_fired(now);
        }
        if once {
            if let Some(removed) = core.tasks.remove(id) {
                self.publish(SchedulerEvent::Deleted(removed));
            }
        }
    }

    fn expire_task(&self, core: &mut Core, task: Task) {
        info!(task_id = %task.id, owner = %task.owner, "task expired");
        self.publish(SchedulerEvent::Expired(task.clone()));
        if let Some(removed) = core.tasks.remove(task.id) {
            self.publish(SchedulerEvent::Deleted(removed));
        }
    }

    /// Drop a missed run of a task without `force_run`.
    fn skip_missed_task(&self, core: &mut Core, task: Task, now: DateTime<Utc>) {
        debug!(task_id = %task.id, next_run = %task.next_run, "skipping missed run");
        if task.occurrence == Occurrence::Once {
            if let Some(removed) = core.tasks.remove(task.id) {
                self.publish(SchedulerEvent::Deleted(removed));
            }
            return;
        }

        if let Some(entry) = core.tasks.get_mut(task.id) {
            entry.skip_to_next(now);
            let snapshot = entry.clone();
            self.publish(SchedulerEvent::Changed(snapshot));
        }
    }

    /// Program the wake timer for the soonest wake-worthy task.
    fn arm_wake_timer(&self, now: DateTime<Utc>) {
        let core = self.lock_core();
        let Some(timer) = core.wake_timer.as_ref() else {
            debug!("no wake timer, suspend proceeds without wake-up");
            return;
        };

        let next_wake = core
            .tasks
            .iter()
            .filter(|task| task.wakeup_system && !task.is_expired(now))
            .filter(|task| task.next_run < DateTime::<Utc>::MAX_UTC)
            .min_by_key(|task| task.next_run);

        let result = match next_wake {
            Some(task) => {
                // A deadline already in the past maps to zero, which cancels.
                let delay = task
                    .next_run
                    .signed_duration_since(now)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                info!(
                    task_id = %task.id,
                    deadline_secs = delay.as_secs_f64(),
                    "arming wake timer for suspend"
                );
                timer.set_deadline(delay)
            }
            None => timer.cancel(),
        };

        if let Err(e) = result {
            warn!(os_code = ?e.os_code(), "wake-on-suspend unavailable this cycle: {e}");
        }
    }
}

async fn poll_loop(
    shared: Arc<Shared>,
    mut power_rx: broadcast::Receiver<PowerEvent>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut power_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => shared.poll_tick(Utc::now()),
            _ = wake.notified() => {
                debug!("woken by wake timer");
                shared.poll_tick(Utc::now());
            }
            msg = power_rx.recv(), if power_open => match msg {
                Ok(event) => shared.handle_power_event(event, Utc::now()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "power events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("power event bus closed");
                    power_open = false;
                }
            },
        }
    }
    debug!("scheduler loop exited");
}

fn default_timer_factory(clock: TimerClock) -> TimerFactory {
    Box::new(move |on_expired| {
        WaitableTimer::new(clock, on_expired).map(|timer| Box::new(timer) as Box<dyn WakeTimer>)
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::SchedulerError;
    use crate::scheduler::events::SchedulerEventKind;
    use crate::scheduler::store::MemoryStore;
    use crate::scheduler::task::Schedule;
    use chrono::TimeZone;

    /// Records every deadline the scheduler programs; `None` = cancelled.
    #[derive(Clone, Default)]
    struct RecordingTimer {
        calls: Arc<Mutex<Vec<Option<Duration>>>>,
    }

    impl WakeTimer for RecordingTimer {
        fn set_deadline(&self, after: Duration) -> std::result::Result<(), TimerError> {
            let entry = if after.is_zero() { None } else { Some(after) };
            self.calls.lock().unwrap().push(entry);
            Ok(())
        }

        fn cancel(&self) -> std::result::Result<(), TimerError> {
            self.calls.lock().unwrap().push(None);
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 22, 0, 0).unwrap()
    }

    fn make_scheduler() -> (Scheduler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let (bus, _) = broadcast::channel(8);
        let scheduler = Scheduler::new(&SchedulerConfig::default(), Arc::clone(&store), bus);
        (scheduler, store)
    }

    fn with_recording_timer(scheduler: &Scheduler) -> RecordingTimer {
        let timer = RecordingTimer::default();
        scheduler.shared.lock_core().wake_timer = Some(Box::new(timer.clone()));
        timer
    }

    fn drain(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn kinds(events: &[SchedulerEvent]) -> Vec<SchedulerEventKind> {
        events.iter().map(SchedulerEvent::kind).collect()
    }

    #[test]
    fn add_assigns_fresh_id_and_persists() {
        let (scheduler, store) = make_scheduler();
        let mut rx = scheduler.subscribe();

        let mut task = Task::once_at("epg", t0());
        task.id = TaskId::generate();
        let caller_id = task.id;

        let id = scheduler.add_task(task).unwrap();

        assert_ne!(id, caller_id);
        assert!(!id.is_unassigned());
        assert_eq!(scheduler.get_task(id).unwrap().id, id);
        assert_eq!(store.saves(), 1);
        assert_eq!(store.snapshot().tasks.len(), 1);
        assert_eq!(kinds(&drain(&mut rx)), vec![SchedulerEventKind::Changed]);
    }

    #[test]
    fn add_rejects_invalid_task() {
        let (scheduler, store) = make_scheduler();
        let task = Task::new("o", Occurrence::Repeat, Schedule::Interval { secs: 0 });
        assert!(matches!(
            scheduler.add_task(task),
            Err(SchedulerError::InvalidTask(_))
        ));
        assert_eq!(scheduler.task_count(), 0);
        assert_eq!(store.saves(), 0);
    }

    #[test]
    fn update_replaces_and_remove_is_soft() {
        let (scheduler, _store) = make_scheduler();
        let id = scheduler.add_task(Task::once_at("o", t0())).unwrap();
        let mut rx = scheduler.subscribe();

        let replacement = Task::once_at("o", t0() + TimeDelta::hours(1)).with_force_run(true);
        scheduler.update_task(id, replacement).unwrap();
        let stored = scheduler.get_task(id).unwrap();
        assert!(stored.force_run);
        assert_eq!(stored.next_run, t0() + TimeDelta::hours(1));

        scheduler.remove_task(id);
        scheduler.remove_task(id);
        assert!(scheduler.get_task(id).is_none());
        assert_eq!(
            kinds(&drain(&mut rx)),
            vec![SchedulerEventKind::Changed, SchedulerEventKind::Deleted]
        );
    }

    #[test]
    fn get_task_returns_detached_copy() {
        let (scheduler, _store) = make_scheduler();
        let id = scheduler.add_task(Task::once_at("o", t0())).unwrap();

        let mut copy = scheduler.get_task(id).unwrap();
        copy.owner = "someone else".to_owned();
        copy.wakeup_system = true;

        let fresh = scheduler.get_task(id).unwrap();
        assert_eq!(fresh.owner, "o");
        assert!(!fresh.wakeup_system);
        assert_eq!(scheduler.get_tasks("o").len(), 1);
        assert!(scheduler.get_tasks("someone else").is_empty());
    }

    #[test]
    fn once_task_fires_exactly_once() {
        let (scheduler, _store) = make_scheduler();
        let id = scheduler.add_task(Task::once_at("o", t0())).unwrap();
        let mut rx = scheduler.subscribe();

        scheduler.tick_at(t0() + TimeDelta::seconds(10));
        scheduler.tick_at(t0() + TimeDelta::seconds(30));

        let events = drain(&mut rx);
        assert_eq!(
            kinds(&events),
            vec![SchedulerEventKind::Due, SchedulerEventKind::Deleted]
        );
        assert!(events[0].task().last_run.is_none(), "due carries pre-fire snapshot");
        assert!(scheduler.get_task(id).is_none());
    }

    #[test]
    fn task_not_yet_due_is_left_alone() {
        let (scheduler, store) = make_scheduler();
        scheduler.add_task(Task::once_at("o", t0() + TimeDelta::minutes(5))).unwrap();
        let mut rx = scheduler.subscribe();
        let saves = store.saves();

        scheduler.tick_at(t0());

        assert!(drain(&mut rx).is_empty());
        assert_eq!(store.saves(), saves);
    }

    #[test]
    fn repeat_task_is_rescheduled_past_now() {
        let (scheduler, _store) = make_scheduler();
        let task = Task::new_at("o", Occurrence::Repeat, Schedule::Interval { secs: 300 }, t0())
            .with_next_run(t0());
        let id = scheduler.add_task(task).unwrap();
        let mut rx = scheduler.subscribe();

        let now = t0() + TimeDelta::seconds(20);
        scheduler.tick_at(now);

        let stored = scheduler.get_task(id).unwrap();
        assert_eq!(stored.last_run, Some(t0()));
        assert!(stored.next_run > now);
        let gap = stored.next_run.signed_duration_since(t0()).num_seconds();
        assert!(gap > 0 && gap % 300 == 0);
        assert_eq!(kinds(&drain(&mut rx)), vec![SchedulerEventKind::Due]);
    }

    #[test]
    fn expired_task_emits_expired_then_deleted_without_due() {
        for occurrence in [
            Occurrence::Once,
            Occurrence::Repeat,
            Occurrence::EveryStartup,
            Occurrence::EveryWakeUp,
        ] {
            let (scheduler, _store) = make_scheduler();
            let schedule = if occurrence == Occurrence::Repeat {
                Schedule::Interval { secs: 60 }
            } else {
                Schedule::Fixed
            };
            let task = Task::new_at("o", occurrence, schedule, t0())
                .with_next_run(t0())
                .with_expiration(t0());
            let id = scheduler.add_task(task).unwrap();
            let mut rx = scheduler.subscribe();

            scheduler.tick_at(t0() + TimeDelta::seconds(1));

            assert_eq!(
                kinds(&drain(&mut rx)),
                vec![SchedulerEventKind::Expired, SchedulerEventKind::Deleted],
                "occurrence {occurrence}"
            );
            assert!(scheduler.get_task(id).is_none());
        }
    }

    #[test]
    fn expiry_within_the_due_minute_still_fires() {
        let (scheduler, _store) = make_scheduler();
        let id = scheduler
            .add_task(Task::once_at("o", t0()).with_expiration(t0() + TimeDelta::seconds(30)))
            .unwrap();
        let mut rx = scheduler.subscribe();

        scheduler.tick_at(t0() + TimeDelta::seconds(40));

        assert_eq!(
            kinds(&drain(&mut rx)),
            vec![SchedulerEventKind::Due, SchedulerEventKind::Deleted]
        );
        assert!(scheduler.get_task(id).is_none());
    }

    #[test]
    fn expiry_is_checked_against_the_floored_minute() {
        let (scheduler, _store) = make_scheduler();
        let task = Task::new_at("o", Occurrence::Repeat, Schedule::Interval { secs: 3600 }, t0())
            .with_next_run(t0() + TimeDelta::hours(1))
            .with_expiration(t0() + TimeDelta::seconds(30));
        let id = scheduler.add_task(task).unwrap();
        let mut rx = scheduler.subscribe();

        scheduler.tick_at(t0() + TimeDelta::seconds(59));
        assert!(drain(&mut rx).is_empty());
        assert!(scheduler.get_task(id).is_some());

        scheduler.tick_at(t0() + TimeDelta::minutes(1));
        assert_eq!(
            kinds(&drain(&mut rx)),
            vec![SchedulerEventKind::Expired, SchedulerEventKind::Deleted]
        );
    }

    #[test]
    fn missed_run_without_force_is_skipped() {
        let (scheduler, _store) = make_scheduler();
        let once = scheduler
            .add_task(Task::once_at("o", t0() - TimeDelta::hours(1)))
            .unwrap();
        let repeat = scheduler
            .add_task(
                Task::new_at("o", Occurrence::Repeat, Schedule::Interval { secs: 600 }, t0())
                    .with_next_run(t0() - TimeDelta::hours(1)),
            )
            .unwrap();
        let mut rx = scheduler.subscribe();

        scheduler.tick_at(t0());

        let events = drain(&mut rx);
        assert!(events.iter().all(|e| e.kind() != SchedulerEventKind::Due));
        assert!(scheduler.get_task(once).is_none());
        let repeat = scheduler.get_task(repeat).unwrap();
        assert!(repeat.next_run > t0());
        assert!(repeat.last_run.is_none());
    }

    #[test]
    fn missed_run_with_force_fires_once() {
        let (scheduler, _store) = make_scheduler();
        let id = scheduler
            .add_task(Task::once_at("o", t0() - TimeDelta::hours(1)).with_force_run(true))
            .unwrap();
        let mut rx = scheduler.subscribe();

        scheduler.tick_at(t0());
        scheduler.tick_at(t0() + TimeDelta::seconds(20));

        assert_eq!(
            kinds(&drain(&mut rx)),
            vec![SchedulerEventKind::Due, SchedulerEventKind::Deleted]
        );
        assert!(scheduler.get_task(id).is_none());
    }

    #[test]
    fn poll_tick_ignores_startup_and_wakeup_tasks() {
        let (scheduler, _store) = make_scheduler();
        scheduler
            .add_task(Task::new("o", Occurrence::EveryStartup, Schedule::Fixed).with_next_run(t0()))
            .unwrap();
        let mut rx = scheduler.subscribe();

        scheduler.tick_at(t0() + TimeDelta::minutes(1));

        assert!(drain(&mut rx).is_empty());
        assert_eq!(scheduler.task_count(), 1);
    }

    #[test]
    fn resume_fires_wakeup_tasks_and_keeps_them() {
        let (scheduler, _store) = make_scheduler();
        let wake_id = scheduler
            .add_task(Task::new("o", Occurrence::EveryWakeUp, Schedule::Fixed))
            .unwrap();
        scheduler
            .add_task(Task::new("o", Occurrence::EveryStartup, Schedule::Fixed))
            .unwrap();
        let mut rx = scheduler.subscribe();

        scheduler.handle_power_event_at(PowerEvent::Resuming, t0());

        let events = drain(&mut rx);
        assert_eq!(kinds(&events), vec![SchedulerEventKind::Due]);
        assert_eq!(events[0].task().id, wake_id);
        let stored = scheduler.get_task(wake_id).unwrap();
        assert_eq!(stored.last_run, Some(t0()));
        assert_eq!(scheduler.task_count(), 2);
    }

    #[test]
    fn resume_expires_expired_wakeup_tasks_without_firing() {
        let (scheduler, _store) = make_scheduler();
        let id = scheduler
            .add_task(
                Task::new("o", Occurrence::EveryWakeUp, Schedule::Fixed)
                    .with_expiration(t0() - TimeDelta::minutes(1)),
            )
            .unwrap();
        let mut rx = scheduler.subscribe();

        scheduler.handle_power_event_at(PowerEvent::Resuming, t0());

        let events = drain(&mut rx);
        assert_eq!(
            kinds(&events),
            vec![SchedulerEventKind::Expired, SchedulerEventKind::Deleted]
        );
        assert!(events.iter().all(|e| e.task().id == id));
        assert!(scheduler.get_task(id).is_none());
    }

    #[test]
    fn suspend_arms_timer_for_soonest_wakeup_task() {
        let (scheduler, _store) = make_scheduler();
        let timer = with_recording_timer(&scheduler);
        let now = t0();

        scheduler
            .add_task(Task::once_at("a", now + TimeDelta::minutes(10)).with_wakeup_system(true))
            .unwrap();
        scheduler
            .add_task(Task::once_at("b", now + TimeDelta::minutes(5)))
            .unwrap();
        scheduler
            .add_task(Task::once_at("c", now + TimeDelta::minutes(20)).with_wakeup_system(true))
            .unwrap();

        scheduler.handle_power_event_at(PowerEvent::Suspending, now);

        assert_eq!(
            *timer.calls.lock().unwrap(),
            vec![Some(Duration::from_secs(600))]
        );
    }

    #[test]
    fn suspend_skips_expired_wakeup_tasks() {
        let (scheduler, _store) = make_scheduler();
        let timer = with_recording_timer(&scheduler);
        let now = t0();

        scheduler
            .add_task(
                Task::once_at("a", now + TimeDelta::minutes(10))
                    .with_wakeup_system(true)
                    .with_expiration(now),
            )
            .unwrap();

        scheduler.handle_power_event_at(PowerEvent::Suspending, now);

        assert_eq!(*timer.calls.lock().unwrap(), vec![None]);
    }

    #[test]
    fn suspend_without_timer_is_harmless() {
        let (scheduler, _store) = make_scheduler();
        scheduler
            .add_task(Task::once_at("a", t0() + TimeDelta::minutes(10)).with_wakeup_system(true))
            .unwrap();
        scheduler.handle_power_event_at(PowerEvent::Suspending, t0());
        assert_eq!(scheduler.task_count(), 1);
    }

    #[test]
    fn corrupt_store_loads_as_empty() {
        struct BrokenStore;
        impl SchedulerStore for BrokenStore {
            fn load(&self) -> Result<SchedulerState> {
                Err(SchedulerError::Persistence("corrupt".to_owned()))
            }
            fn save(&self, _state: &SchedulerState) -> Result<()> {
                Err(SchedulerError::Persistence("read-only".to_owned()))
            }
        }

        let (bus, _) = broadcast::channel(1);
        let scheduler = Scheduler::new(&SchedulerConfig::default(), BrokenStore, bus);
        assert_eq!(scheduler.task_count(), 0);

        // Failed saves do not affect in-memory scheduling.
        let id = scheduler.add_task(Task::once_at("o", t0())).unwrap();
        assert!(scheduler.get_task(id).is_some());
    }

    #[test]
    fn persisted_tasks_are_loaded_at_construction() {
        let mut task = Task::once_at("o", t0());
        task.id = TaskId::generate();
        let store = Arc::new(MemoryStore::with_tasks(vec![task.clone()]));
        let (bus, _) = broadcast::channel(1);

        let scheduler = Scheduler::new(&SchedulerConfig::default(), Arc::clone(&store), bus);

        assert_eq!(scheduler.get_task(task.id), Some(task));
        assert_eq!(store.saves(), 0);
    }

    #[tokio::test]
    async fn startup_fires_startup_tasks_and_starts_loop() {
        let (scheduler, _store) = make_scheduler();
        let scheduler = scheduler.with_timer_factory(Box::new(|_| {
            Ok(Box::new(RecordingTimer::default()) as Box<dyn WakeTimer>)
        }));
        let id = scheduler
            .add_task(Task::new("o", Occurrence::EveryStartup, Schedule::Fixed))
            .unwrap();
        let mut rx = scheduler.subscribe();

        scheduler.startup();
        assert!(scheduler.is_running());

        let event = rx.try_recv().expect("startup task fired synchronously");
        assert_eq!(event.kind(), SchedulerEventKind::Due);
        assert_eq!(event.task().id, id);
        assert!(scheduler.get_task(id).unwrap().last_run.is_some());

        scheduler.shutdown().await;
        assert!(!scheduler.is_running());
        assert!(scheduler.shared.lock_core().wake_timer.is_none());
    }

    #[tokio::test]
    async fn startup_expires_expired_startup_tasks_without_firing() {
        let (scheduler, store) = make_scheduler();
        let scheduler = scheduler.with_timer_factory(Box::new(|_| {
            Ok(Box::new(RecordingTimer::default()) as Box<dyn WakeTimer>)
        }));
        let id = scheduler
            .add_task(
                Task::new("o", Occurrence::EveryStartup, Schedule::Fixed)
                    .with_expiration(Utc::now() - TimeDelta::minutes(1)),
            )
            .unwrap();
        let mut rx = scheduler.subscribe();
        let saves = store.saves();

        scheduler.startup();

        let events = drain(&mut rx);
        assert_eq!(
            kinds(&events),
            vec![SchedulerEventKind::Expired, SchedulerEventKind::Deleted]
        );
        assert!(events.iter().all(|e| e.task().id == id));
        assert!(scheduler.get_task(id).is_none());
        assert!(store.saves() > saves);
        assert!(store.snapshot().tasks.is_empty());

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn dropping_a_running_scheduler_stops_its_loop() {
        let (scheduler, _store) = make_scheduler();
        let scheduler = scheduler.with_timer_factory(Box::new(|_| {
            Ok(Box::new(RecordingTimer::default()) as Box<dyn WakeTimer>)
        }));
        scheduler.startup();
        let shared = Arc::downgrade(&scheduler.shared);

        drop(scheduler);

        tokio::time::timeout(Duration::from_secs(5), async {
            while shared.upgrade().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("poll loop released scheduler state");
    }

    #[tokio::test]
    async fn startup_survives_timer_creation_failure() {
        let (scheduler, _store) = make_scheduler();
        let scheduler = scheduler.with_timer_factory(Box::new(|_| {
            Err(TimerError {
                op: "create",
                source: std::io::Error::from_raw_os_error(libc::EPERM),
            })
        }));

        scheduler.startup();
        assert!(scheduler.is_running());
        scheduler.handle_power_event(PowerEvent::Suspending);

        scheduler.shutdown().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn power_events_are_received_from_bus() {
        let store = Arc::new(MemoryStore::new());
        let (bus, _) = broadcast::channel(8);
        let scheduler = Scheduler::new(&SchedulerConfig::default(), Arc::clone(&store), bus.clone())
            .with_timer_factory(Box::new(|_| Ok(Box::new(RecordingTimer::default()) as Box<dyn WakeTimer>)));
        let id = scheduler
            .add_task(Task::new("o", Occurrence::EveryWakeUp, Schedule::Fixed))
            .unwrap();
        let mut rx = scheduler.subscribe();

        scheduler.startup();
        bus.send(PowerEvent::Resuming).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        assert_eq!(event.kind(), SchedulerEventKind::Due);
        assert_eq!(event.task().id, id);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn wake_timer_expiry_triggers_a_tick() {
        let (scheduler, _store) = make_scheduler();
        let handler: Arc<Mutex<Option<ExpiryHandler>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&handler);
        let scheduler = scheduler.with_timer_factory(Box::new(move |on_expired| {
            *slot.lock().unwrap() = Some(on_expired);
            Ok(Box::new(RecordingTimer::default()) as Box<dyn WakeTimer>)
        }));

        scheduler.startup();
        // Let the loop consume its immediate first tick.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let id = scheduler
            .add_task(Task::once_at("o", Utc::now() - TimeDelta::minutes(1)))
            .unwrap();
        let mut rx = scheduler.subscribe();

        (handler.lock().unwrap().as_ref().expect("handler wired"))();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("tick in time")
            .expect("channel open");
        assert_eq!(event.kind(), SchedulerEventKind::Due);
        assert_eq!(event.task().id, id);

        scheduler.shutdown().await;
    }
}
