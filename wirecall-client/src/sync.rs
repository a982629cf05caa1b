//! Concurrency primitives used by per-call state.
//!
//! This module provides:
//! - [`Locked`]: mutual exclusion around a single value
//! - [`TimeoutTimer`]: a one-shot, cancelable deadline timer
//!
//! Per-call mutable state (retry counters, completion flags, timer state) is
//! owned by exactly one call and accessed through [`Locked`] whenever the
//! completion path and the cancellation path can race on it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Mutual exclusion around a single value.
///
/// Every read and write of the guarded value happens while holding the lock.
/// Critical sections must be kept minimal: no blocking calls while held.
pub struct Locked<T> {
    inner: Mutex<T>,
}

impl<T> Locked<T> {
    /// Wrap a value.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Perform an action with the guarded value, potentially updating it.
    ///
    /// Returns the result of the closure. A poisoned lock is recovered rather
    /// than propagated: the guarded values here stay consistent under any
    /// partial update.
    pub fn with<R>(&self, action: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        action(&mut guard)
    }

    /// Read a copy of the guarded value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(|value| value.clone())
    }

    /// Replace the guarded value.
    pub fn set(&self, value: T) {
        self.with(|slot| *slot = value);
    }
}

impl<T: Default> Default for Locked<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Locked<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Ok(guard) => f.debug_tuple("Locked").field(&*guard).finish(),
            Err(_) => f.write_str("Locked(<locked>)"),
        }
    }
}

#[derive(Default)]
struct TimerState {
    task: Option<JoinHandle<()>>,
    armed: bool,
    fired: bool,
    canceled: bool,
}

/// One-shot deadline timer.
///
/// `start` arms a callback on a background task after the configured duration
/// elapses; `cancel` is idempotent and prevents a not-yet-fired callback from
/// firing. The timer never cancels itself: a call that completes before its
/// deadline must cancel the timer it owns.
pub struct TimeoutTimer {
    timeout: Duration,
    state: Arc<Locked<TimerState>>,
}

impl TimeoutTimer {
    /// Create a timer with the given duration. The timer is not armed until
    /// [`start`](Self::start) is called.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Arc::new(Locked::default()),
        }
    }

    /// The configured duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm the timer. `on_timeout` runs on a background task after the
    /// configured duration, unless [`cancel`](Self::cancel) is called first.
    ///
    /// Arming an already-armed or canceled timer has no effect.
    pub fn start<F>(&self, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let armed = self.state.with(|state| {
            if state.armed || state.canceled {
                return false;
            }
            state.armed = true;
            true
        });
        if !armed {
            return;
        }

        let state = Arc::clone(&self.state);
        let timeout = self.timeout;
        let task = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                tokio::time::sleep(timeout).await;
                let should_fire = state.with(|state| {
                    if state.canceled {
                        return false;
                    }
                    state.fired = true;
                    true
                });
                if should_fire {
                    on_timeout();
                }
            }
        });
        self.state.with(|state| {
            if state.canceled {
                task.abort();
            } else {
                state.task = Some(task);
            }
        });
    }

    /// Cancel the timer. Idempotent; a callback that has not fired yet will
    /// never fire after this returns.
    pub fn cancel(&self) {
        let task = self.state.with(|state| {
            state.canceled = true;
            state.task.take()
        });
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Whether the timer has fired. Safe to call concurrently with arming and
    /// canceling.
    pub fn timed_out(&self) -> bool {
        self.state.with(|state| state.fired)
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
