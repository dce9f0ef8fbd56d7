// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Threading helpers shared by the xenbe crates: a cancellable fd wait, a single-threaded
//! task queue and a cancellable timer.

pub use vmm_sys_util::{epoll, eventfd};

pub mod async_context;
pub mod poll_fd;
pub mod time;
pub mod timer;

use std::sync::{LockResult, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Worker threads in this workspace report errors through callbacks instead of panicking, so a
/// poisoned lock only means a client hook panicked; the protected state is still consistent.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    extract_guard(mutex.lock())
}

fn extract_guard<G>(lock_result: LockResult<G>) -> G {
    match lock_result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Joins `handle` unless it refers to the calling thread.
///
/// Returns `false` when the join was skipped. Stopping a worker from one of its own callbacks
/// must not deadlock, the worker exits on its own once the callback returns.
pub fn join_unless_current(handle: JoinHandle<()>) -> bool {
    if handle.thread().id() == thread::current().id() {
        return false;
    }

    if handle.join().is_err() {
        log::error!("Worker thread panicked");
    }

    true
}
