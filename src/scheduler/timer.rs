//! Wakeable OS timer.
//!
//! [`WaitableTimer`] owns one OS timer and a dedicated waiter thread. Arming
//! replaces any pending deadline; when a deadline elapses the waiter thread
//! invokes the expiry handler. On Linux the timer is a `timerfd` on
//! `CLOCK_BOOTTIME_ALARM`, which resumes a suspended machine (requires
//! `CAP_WAKE_ALARM`). Elsewhere a condvar-based backend keeps the same
//! contract without the wake capability.
//!
//! The waiter thread is stopped cooperatively: [`WaitableTimer::close`]
//! signals it, joins it and then releases the OS handles. `close` is
//! idempotent and also runs on drop. A closed timer rejects further arming.

use crate::error::TimerError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Callback run on the waiter thread when the deadline elapses.
pub type ExpiryHandler = Box<dyn Fn() + Send + Sync + 'static>;

/// A re-armable one-shot timer the scheduler programs on suspend.
pub trait WakeTimer: Send + Sync {
    /// Arm the timer to fire `after` from now, replacing any pending
    /// deadline. A zero duration cancels instead of firing.
    fn set_deadline(&self, after: Duration) -> Result<(), TimerError>;

    /// Cancel the pending deadline, if any.
    fn cancel(&self) -> Result<(), TimerError>;
}

/// Clock backing a [`WaitableTimer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerClock {
    /// Wall-clock alarm that keeps counting in suspend and wakes the system.
    #[default]
    Alarm,
    /// Monotonic clock; does not wake the system.
    Monotonic,
}

/// Outcome of one blocking wait on a backend.
enum WaitOutcome {
    Expired,
    Stopped,
    Spurious,
}

trait Backend: Send + Sync {
    fn arm(&self, after: Duration) -> Result<(), TimerError>;
    fn disarm(&self) -> Result<(), TimerError>;
    fn wait(&self) -> WaitOutcome;
    fn stop(&self);
}

/// OS wake timer with a dedicated waiter thread.
pub struct WaitableTimer {
    backend: Mutex<Option<Arc<dyn Backend>>>,
    armed_until: Arc<Mutex<Option<SystemTime>>>,
    waiter: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WaitableTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitableTimer")
            .field("armed_until", &self.deadline())
            .finish_non_exhaustive()
    }
}

impl WaitableTimer {
    /// Create the OS timer and start its waiter thread.
    ///
    /// Fails with [`TimerError`] when the OS refuses the timer, e.g. when
    /// the process lacks the privilege to use an alarm clock.
    pub fn new(clock: TimerClock, on_expired: ExpiryHandler) -> Result<Self, TimerError> {
        let backend = create_backend(clock)?;
        let armed_until = Arc::new(Mutex::new(None));

        let thread_backend = Arc::clone(&backend);
        let thread_armed = Arc::clone(&armed_until);
        let waiter = std::thread::Builder::new()
            .name("wake-timer".to_owned())
            .spawn(move || wait_loop(thread_backend.as_ref(), &thread_armed, &on_expired))
            .map_err(|source| TimerError { op: "spawn", source })?;

        debug!(?clock, "wake timer created");
        Ok(Self {
            backend: Mutex::new(Some(backend)),
            armed_until,
            waiter: Mutex::new(Some(waiter)),
        })
    }

    /// Arm the timer for `after` from now; zero cancels.
    pub fn set_deadline(&self, after: Duration) -> Result<(), TimerError> {
        if after.is_zero() {
            return self.cancel();
        }
        let backend = self.backend("arm")?;
        let mut armed = lock(&self.armed_until);
        backend.arm(after)?;
        *armed = SystemTime::now().checked_add(after);
        debug!(deadline_secs = after.as_secs_f64(), "wake timer armed");
        Ok(())
    }

    /// Cancel the pending deadline.
    pub fn cancel(&self) -> Result<(), TimerError> {
        let backend = self.backend("cancel")?;
        let mut armed = lock(&self.armed_until);
        backend.disarm()?;
        *armed = None;
        Ok(())
    }

    /// Wall-clock time the timer is armed for, if armed.
    #[must_use]
    pub fn deadline(&self) -> Option<SystemTime> {
        *lock(&self.armed_until)
    }

    /// Cancel, stop the waiter thread and release the OS handle.
    /// Safe to call repeatedly.
    pub fn close(&self) {
        let Some(waiter) = lock(&self.waiter).take() else {
            return;
        };

        if let Err(e) = self.cancel() {
            warn!("failed to cancel wake timer on close: {e}");
        }
        let Some(backend) = lock(&self.backend).take() else {
            return;
        };
        backend.stop();

        // Closing from inside the expiry handler must not join itself; the
        // handles then close when the waiter thread returns.
        if waiter.thread().id() != std::thread::current().id() && waiter.join().is_err() {
            warn!("wake timer waiter thread panicked");
        }
        drop(backend);
        debug!("wake timer closed");
    }

    fn backend(&self, op: &'static str) -> Result<Arc<dyn Backend>, TimerError> {
        lock(&self.backend).clone().ok_or_else(|| TimerError {
            op,
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, "wake timer is closed"),
        })
    }
}

impl WakeTimer for WaitableTimer {
    fn set_deadline(&self, after: Duration) -> Result<(), TimerError> {
        WaitableTimer::set_deadline(self, after)
    }

    fn cancel(&self) -> Result<(), TimerError> {
        WaitableTimer::cancel(self)
    }
}

impl Drop for WaitableTimer {
    fn drop(&mut self) {
        self.close();
    }
}

fn wait_loop(
    backend: &dyn Backend,
    armed_until: &Mutex<Option<SystemTime>>,
    on_expired: &ExpiryHandler,
) {
    loop {
        match backend.wait() {
            WaitOutcome::Expired => {
                clear_elapsed_deadline(armed_until, SystemTime::now());
                debug!("wake timer expired");
                on_expired();
            }
            WaitOutcome::Spurious => {}
            WaitOutcome::Stopped => break,
        }
    }
}

/// Forget the armed deadline unless a re-arm already replaced it with a
/// later one.
fn clear_elapsed_deadline(armed_until: &Mutex<Option<SystemTime>>, now: SystemTime) {
    let mut armed = lock(armed_until);
    if armed.is_some_and(|deadline| deadline <= now) {
        *armed = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(target_os = "linux")]
fn create_backend(clock: TimerClock) -> Result<Arc<dyn Backend>, TimerError> {
    Ok(Arc::new(timerfd::TimerFd::new(clock)?))
}

#[cfg(not(target_os = "linux"))]
fn create_backend(clock: TimerClock) -> Result<Arc<dyn Backend>, TimerError> {
    if clock == TimerClock::Alarm {
        warn!("no OS wake timer on this platform; deadlines will not wake the system");
    }
    Ok(Arc::new(condvar::CondvarTimer::default()))
}

#[cfg(target_os = "linux")]
mod timerfd {
    use super::{Backend, TimerClock, WaitOutcome};
    use crate::error::TimerError;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::time::Duration;

    /// `timerfd` armed by the scheduler plus an `eventfd` stop signal.
    pub(super) struct TimerFd {
        timer: OwnedFd,
        stop: OwnedFd,
    }

    impl TimerFd {
        pub(super) fn new(clock: TimerClock) -> Result<Self, TimerError> {
            let clock_id = match clock {
                TimerClock::Alarm => libc::CLOCK_BOOTTIME_ALARM,
                TimerClock::Monotonic => libc::CLOCK_MONOTONIC,
            };

            // SAFETY: plain syscall; the returned descriptor is checked below.
            let fd = unsafe { libc::timerfd_create(clock_id, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK) };
            if fd < 0 {
                return Err(TimerError::last_os_error("create"));
            }
            // SAFETY: `fd` is a freshly created descriptor owned by nobody else.
            let timer = unsafe { OwnedFd::from_raw_fd(fd) };

            // SAFETY: plain syscall; the returned descriptor is checked below.
            let efd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
            if efd < 0 {
                return Err(TimerError::last_os_error("create stop signal"));
            }
            // SAFETY: `efd` is a freshly created descriptor owned by nobody else.
            let stop = unsafe { OwnedFd::from_raw_fd(efd) };

            Ok(Self { timer, stop })
        }

        fn settime(&self, value: Duration, op: &'static str) -> Result<(), TimerError> {
            let spec = libc::itimerspec {
                it_interval: libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 0,
                },
                it_value: libc::timespec {
                    tv_sec: libc::time_t::try_from(value.as_secs()).unwrap_or(libc::time_t::MAX),
                    tv_nsec: libc::c_long::try_from(value.subsec_nanos()).unwrap_or(0),
                },
            };
            // SAFETY: `spec` is a valid itimerspec and the old-value pointer may be null.
            let rc = unsafe {
                libc::timerfd_settime(self.timer.as_raw_fd(), 0, &spec, std::ptr::null_mut())
            };
            if rc < 0 {
                return Err(TimerError::last_os_error(op));
            }
            Ok(())
        }

        /// Drain the expiration counter. `false` when nothing was pending,
        /// which happens when a re-arm raced the wake-up.
        fn consume_expiration(&self) -> bool {
            let mut expirations: u64 = 0;
            // SAFETY: reads exactly 8 bytes into a live u64.
            let n = unsafe {
                libc::read(
                    self.timer.as_raw_fd(),
                    std::ptr::addr_of_mut!(expirations).cast(),
                    std::mem::size_of::<u64>(),
                )
            };
            n == 8 && expirations > 0
        }
    }

    impl Backend for TimerFd {
        fn arm(&self, after: Duration) -> Result<(), TimerError> {
            self.settime(after, "arm")
        }

        fn disarm(&self) -> Result<(), TimerError> {
            self.settime(Duration::ZERO, "cancel")
        }

        fn wait(&self) -> WaitOutcome {
            let mut fds = [
                libc::pollfd {
                    fd: self.timer.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.stop.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            // SAFETY: `fds` is a live array of two pollfd entries.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    return WaitOutcome::Spurious;
                }
                tracing::error!("wake timer poll failed, stopping waiter: {err}");
                return WaitOutcome::Stopped;
            }
            if fds[1].revents != 0 {
                return WaitOutcome::Stopped;
            }
            if fds[0].revents & libc::POLLIN != 0 && self.consume_expiration() {
                return WaitOutcome::Expired;
            }
            WaitOutcome::Spurious
        }

        fn stop(&self) {
            let one: u64 = 1;
            // SAFETY: writes exactly 8 bytes from a live u64.
            let n = unsafe {
                libc::write(
                    self.stop.as_raw_fd(),
                    std::ptr::addr_of!(one).cast(),
                    std::mem::size_of::<u64>(),
                )
            };
            if n != 8 {
                tracing::warn!(
                    "failed to signal wake timer stop: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(any(not(target_os = "linux"), test))]
mod condvar {
    use super::{Backend, WaitOutcome};
    use crate::error::TimerError;
    use std::sync::{Condvar, Mutex, PoisonError};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct State {
        deadline: Option<Instant>,
        stopped: bool,
    }

    /// Portable in-process timer. Cannot wake a suspended machine.
    #[derive(Default)]
    pub(super) struct CondvarTimer {
        state: Mutex<State>,
        changed: Condvar,
    }

    impl Backend for CondvarTimer {
        fn arm(&self, after: Duration) -> Result<(), TimerError> {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.deadline = Instant::now().checked_add(after);
            self.changed.notify_all();
            Ok(())
        }

        fn disarm(&self) -> Result<(), TimerError> {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.deadline = None;
            self.changed.notify_all();
            Ok(())
        }

        fn wait(&self) -> WaitOutcome {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if state.stopped {
                    return WaitOutcome::Stopped;
                }
                match state.deadline {
                    None => {
                        state = self
                            .changed
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            state.deadline = None;
                            return WaitOutcome::Expired;
                        }
                        state = self
                            .changed
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                }
            }
        }

        fn stop(&self) {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.stopped = true;
            self.changed.notify_all();
        }
    }
}
