// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! FIFO of deferred calls executed on one dedicated thread.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::{join_unless_current, lock};

/// A deferred call.
pub type AsyncCall = Box<dyn FnOnce() + Send + 'static>;

/// Errors associated with [`AsyncContext`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum AsyncContextError {
    /// Cannot spawn the async context thread: {0}
    Spawn(io::Error),
    /// Async context is stopped
    Stopped,
}

#[derive(Default)]
struct Queue {
    calls: VecDeque<AsyncCall>,
    terminate: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    cond_var: Condvar,
}

/// Runs submitted calls in submission order on its own thread.
pub struct AsyncContext {
    name: String,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl AsyncContext {
    /// Spawns the worker thread. `name` is used for the thread name.
    pub fn new(name: &str) -> Result<Self, AsyncContextError> {
        let shared = Arc::new(Shared::default());

        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("xenbe_async {name}"))
                .spawn(move || Self::run(&shared))
                .map_err(AsyncContextError::Spawn)?
        };

        Ok(AsyncContext {
            name: name.to_string(),
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues `call` for execution on the context thread.
    pub fn submit<F>(&self, call: F) -> Result<(), AsyncContextError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = lock(&self.shared.queue);

        if queue.terminate {
            return Err(AsyncContextError::Stopped);
        }

        queue.calls.push_back(Box::new(call));
        self.shared.cond_var.notify_all();

        Ok(())
    }

    /// Stops accepting calls, runs the ones already queued and joins the thread.
    ///
    /// Safe to call repeatedly and from within a queued call.
    pub fn stop(&self) {
        {
            let mut queue = lock(&self.shared.queue);
            queue.terminate = true;
            self.shared.cond_var.notify_all();
        }

        let thread = lock(&self.thread).take();

        if let Some(handle) = thread {
            join_unless_current(handle);
        }
    }

    fn run(shared: &Shared) {
        let mut queue = lock(&shared.queue);

        loop {
            while let Some(call) = queue.calls.pop_front() {
                drop(queue);
                call();
                queue = lock(&shared.queue);
            }

            if queue.terminate {
                break;
            }

            queue = match shared.cond_var.wait(queue) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

impl Drop for AsyncContext {
    fn drop(&mut self) {
        self.stop();
    }
}
