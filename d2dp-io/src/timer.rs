//! Periodic timers
//!
//! A [`Timer`] is the control handle of a periodic callback; the callback
//! itself runs on a dedicated worker thread started with [`Timer::spawn`].
//! Disabled timers keep ticking without running the callback, so enabling a
//! timer takes effect at the next tick without re-arming anything.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest delay backoff can reach
pub const MAX_DELAY: Duration = Duration::from_secs(3600);

struct TimerState {
    enabled: bool,
    default_delay: Duration,
    delay: Duration,
    retries: u32,
    next_fire: Instant,
    stopped: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Shared control handle of a periodic timer
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Create a disabled timer with the given period
    pub fn new(period: Duration) -> Self {
        Timer {
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    enabled: false,
                    default_delay: period,
                    delay: period,
                    retries: 0,
                    next_fire: Instant::now() + period,
                    stopped: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.shared.state.lock()
    }

    pub fn enable(&self) {
        self.lock().enabled = true;
    }

    pub fn disable(&self) {
        self.lock().enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Re-synchronize the next tick to `reference + period`
    ///
    /// Also restores the default period and clears the retry counter.
    pub fn reset(&self, reference: Instant) {
        let mut state = self.lock();
        state.delay = state.default_delay;
        state.retries = 0;
        state.next_fire = reference + state.default_delay;
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Count one more consecutive fire
    ///
    /// Once the count exceeds `min_retries` every further call doubles the
    /// delay. Returns the new count.
    pub fn backoff(&self, min_retries: u32) -> u32 {
        let mut state = self.lock();
        state.retries += 1;
        if state.retries > min_retries {
            state.delay = state.delay.saturating_mul(2).min(MAX_DELAY);
        }
        state.retries
    }

    /// Current delay between ticks
    pub fn delay(&self) -> Duration {
        self.lock().delay
    }

    /// Consecutive fires counted by [`Timer::backoff`]
    pub fn retries(&self) -> u32 {
        self.lock().retries
    }

    /// Start the worker thread
    ///
    /// `action` runs on every tick while the timer is enabled, never with the
    /// timer state locked. Returning `false` stops the timer for good.
    pub fn spawn<F>(&self, name: &str, action: F) -> io::Result<TimerTask>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(shared, action))?;

        Ok(TimerTask {
            shared: Arc::clone(&self.shared),
            handle: Some(handle),
        })
    }
}

fn run<F>(shared: Arc<TimerShared>, mut action: F)
where
    F: FnMut() -> bool,
{
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            break;
        }

        let deadline = state.next_fire;
        if Instant::now() < deadline {
            shared.cond.wait_until(&mut state, deadline);
            continue;
        }

        if state.enabled {
            let keep_going = MutexGuard::unlocked(&mut state, &mut action);
            if !keep_going {
                state.stopped = true;
                tracing::debug!("timer stopped by its action");
                break;
            }
        }

        // a reset issued while the action ran already moved the deadline
        if state.next_fire == deadline {
            state.next_fire = Instant::now() + state.delay;
        }
    }
}

/// Worker thread of a timer; dropping it stops the timer
pub struct TimerTask {
    shared: Arc<TimerShared>,
    handle: Option<JoinHandle<()>>,
}

impl TimerTask {
    /// Stop the timer and wait for an in-flight action to finish
    pub fn stop(&mut self) {
        self.shared.state.lock().stopped = true;
        self.shared.cond.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("timer worker panicked");
            }
        }
    }

    /// Whether the worker has stopped (either explicitly or by its action)
    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        self.stop();
    }
}
