// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! One-shot and periodic timers running their callback on a dedicated thread.

use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{join_unless_current, lock};

/// Callback invoked when a [`Timer`] fires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Errors associated with [`Timer`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum TimerError {
    /// Timer is already started
    AlreadyStarted,
    /// Cannot spawn the timer thread: {0}
    Spawn(io::Error),
}

#[derive(Default)]
struct Shared {
    terminate: Mutex<bool>,
    cond_var: Condvar,
}

/// Fires a callback once after `period`, or every `period` until stopped.
pub struct Timer {
    name: String,
    callback: TimerCallback,
    period: Duration,
    periodic: bool,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("periodic", &self.periodic)
            .finish_non_exhaustive()
    }
}

impl Timer {
    /// Creates a stopped timer.
    pub fn new(name: &str, callback: TimerCallback, period: Duration, periodic: bool) -> Self {
        Timer {
            name: name.to_string(),
            callback,
            period,
            periodic,
            shared: Arc::new(Shared::default()),
            thread: Mutex::new(None),
        }
    }

    /// Starts the timer.
    ///
    /// Fails with [`TimerError::AlreadyStarted`] while a previous start is still pending or,
    /// for periodic timers, until [`Timer::stop`] is called.
    pub fn start(&self) -> Result<(), TimerError> {
        let mut thread = lock(&self.thread);

        if let Some(handle) = thread.as_ref() {
            if !handle.is_finished() {
                return Err(TimerError::AlreadyStarted);
            }
        }

        if let Some(handle) = thread.take() {
            join_unless_current(handle);
        }

        *lock(&self.shared.terminate) = false;

        let shared = self.shared.clone();
        let callback = self.callback.clone();
        let period = self.period;
        let periodic = self.periodic;

        let handle = thread::Builder::new()
            .name(format!("xenbe_timer {}", self.name))
            .spawn(move || Self::run(&shared, callback.as_ref(), period, periodic))
            .map_err(TimerError::Spawn)?;

        *thread = Some(handle);

        Ok(())
    }

    /// Cancels a pending expiry and joins the timer thread. Does nothing if not started.
    pub fn stop(&self) {
        {
            let mut terminate = lock(&self.shared.terminate);
            *terminate = true;
            self.shared.cond_var.notify_all();
        }

        let thread = lock(&self.thread).take();

        if let Some(handle) = thread {
            join_unless_current(handle);
        }
    }

    /// Returns `true` while the timer thread is alive.
    pub fn is_running(&self) -> bool {
        lock(&self.thread)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn run(shared: &Shared, callback: &(dyn Fn() + Send + Sync), period: Duration, periodic: bool) {
        loop {
            let deadline = Instant::now() + period;
            let mut terminate = lock(&shared.terminate);

            while !*terminate {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }

                terminate = match shared.cond_var.wait_timeout(terminate, deadline - now) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }

            if *terminate {
                return;
            }

            drop(terminate);
            callback();

            if !periodic {
                return;
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
