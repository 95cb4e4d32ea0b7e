// SPDX-License-Identifier: MIT
//! Debounced one-shot timer
//!
//! Every `reset` pushes the deadline out by the full delay, so a burst of
//! triggers collapses into a single firing once the burst goes quiet.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
    fired: u64,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Restartable one-shot timer backed by a dedicated thread
pub struct DebounceTimer {
    delay: Duration,
    shared: Arc<TimerShared>,
    handle: Option<JoinHandle<()>>,
}

impl DebounceTimer {
    /// Spawn the timer thread. `on_fire` runs on that thread, without any
    /// timer lock held, once per expiry.
    pub fn spawn<F>(name: &str, delay: Duration, on_fire: F) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                deadline: None,
                shutdown: false,
                fired: 0,
            }),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_timer(&thread_shared, on_fire))?;

        Ok(Self {
            delay,
            shared,
            handle: Some(handle),
        })
    }

    /// Arm the timer, or push an armed deadline out by the full delay
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.deadline = Some(Instant::now() + self.delay);
        self.shared.wakeup.notify_one();
    }

    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().deadline.is_some()
    }

    /// Time until the armed deadline, if any
    pub fn time_until_fire(&self) -> Option<Duration> {
        self.shared
            .state
            .lock()
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Stop the thread and wait for it. A pending deadline is dropped.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.deadline = None;
            self.shared.wakeup.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer<F: Fn()>(shared: &TimerShared, on_fire: F) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let deadline = state.deadline;
        match deadline {
            None => shared.wakeup.wait(&mut state),
            Some(deadline) if Instant::now() >= deadline => {
                state.deadline = None;
                state.fired += 1;
                debug!(fired = state.fired, "debounce timer expired");
                MutexGuard::unlocked(&mut state, &on_fire);
            }
            Some(deadline) => {
                shared.wakeup.wait_until(&mut state, deadline);
            }
        }
    }
}
