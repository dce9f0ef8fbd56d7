// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory ring channels between a backend and a frontend.
//!
//! Two flavours share the [`RingChannel`] lifecycle:
//!
//! * [`InRing`]: the standard Xen request/response ring. The frontend produces requests, a worker
//!   thread consumes them, runs them through a [`RequestHandler`] and produces responses.
//! * [`OutRing`]: an event page. The backend produces fixed-size records, the frontend consumes
//!   them.
//!
//! Both rings use free-running `u32` indices. A slot position is the index modulo the ring
//! capacity, and a producer that is more than a full ring ahead of its consumer is treated as a
//! corrupted page.

mod in_ring;
mod out_ring;

use std::error::Error;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use log::error;
use utils::lock;
use utils::poll_fd::PollFdError;
use vm_memory::VolatileMemoryError;

pub use self::in_ring::{InRing, RequestHandler, SRING_HEADER_SIZE};
pub(crate) use self::in_ring::{
    sring_capacity, sring_entry_offset, REQ_EVENT, REQ_PROD, RSP_EVENT, RSP_PROD,
};
pub use self::out_ring::{OutRing, DEFAULT_EVENT_OFFSET};
pub(crate) use self::out_ring::{event_capacity, IN_CONS, IN_PROD};
use crate::xen::{EvtchnError, EvtchnPort, GrantError, GrantRef};

/// Error returned by a [`RequestHandler`].
pub type HandlerError = Box<dyn Error + Send + Sync + 'static>;

/// Callback receiving the errors detected by a channel.
///
/// For [`InRing`] it runs on the channel worker thread. It must not block on the channel
/// itself; hand the work off to another thread instead.
pub type ErrorCallback = Arc<dyn Fn(&RingError) + Send + Sync + 'static>;

/// Errors associated with ring channels.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum RingError {
    /// Grant table error: {0}
    Grant(#[from] GrantError),
    /// Event channel error: {0}
    Evtchn(#[from] EvtchnError),
    /// Poll error: {0}
    Poll(#[from] PollFdError),
    /// Ring memory access error: {0}
    Memory(#[from] VolatileMemoryError),
    /// Request processing failed: {0}
    Handler(HandlerError),
    /// Ring index overflow, prod: {prod}, cons: {cons}, capacity: {capacity}
    IndexOverflow {
        /// Producer index.
        prod: u32,
        /// Consumer index.
        cons: u32,
        /// Ring capacity.
        capacity: u32,
    },
    /// Ring is full
    RingFull,
    /// Record of {record_size} bytes doesn't fit in a page at offset {offset}
    InvalidLayout {
        /// Size of one ring record.
        record_size: usize,
        /// Offset of the first record.
        offset: usize,
    },
    /// Cannot spawn the ring thread: {0}
    Spawn(io::Error),
    /// Ring channel is already started
    AlreadyStarted,
    /// Ring channel is not started
    NotStarted,
    /// Ring channel is stopped
    Stopped,
}

impl RingError {
    /// Returns `true` if the channel can't be used any more after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            RingError::Evtchn(err) => !err.is_recoverable(),
            RingError::RingFull
            | RingError::AlreadyStarted
            | RingError::NotStarted
            | RingError::Stopped => false,
            _ => true,
        }
    }
}

/// A transport channel owned by a frontend connection.
pub trait RingChannel: Send + Sync + fmt::Debug {
    /// Starts the channel. Only a freshly created channel can be started.
    fn start(&self) -> Result<(), RingError>;

    /// Stops the channel, waiting for its worker, if any, to exit. Idempotent.
    fn stop(&self);

    /// Returns `true` once a fatal error stopped the channel.
    fn is_terminated(&self) -> bool;

    /// Local event channel port.
    fn port(&self) -> EvtchnPort;

    /// Grant reference of the shared page.
    fn grant_ref(&self) -> GrantRef;

    /// Replaces the callback receiving channel errors. The default one logs them.
    fn set_error_callback(&self, callback: ErrorCallback);
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Idle,
    Running,
    Stopped,
}

impl ChannelState {
    /// Error returned when a start is attempted from this state.
    pub(crate) fn start_error(self) -> Option<RingError> {
        match self {
            ChannelState::Idle => None,
            ChannelState::Running => Some(RingError::AlreadyStarted),
            ChannelState::Stopped => Some(RingError::Stopped),
        }
    }

    /// Error returned when the channel is used from this state.
    pub(crate) fn use_error(self) -> Option<RingError> {
        match self {
            ChannelState::Idle => Some(RingError::NotStarted),
            ChannelState::Running => None,
            ChannelState::Stopped => Some(RingError::Stopped),
        }
    }
}

/// Error reporting shared by both ring flavours.
pub(crate) struct ErrorSink {
    log_id: String,
    callback: Mutex<ErrorCallback>,
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink")
            .field("log_id", &self.log_id)
            .finish_non_exhaustive()
    }
}

impl ErrorSink {
    pub(crate) fn new(log_id: String) -> Self {
        let callback: ErrorCallback = {
            let log_id = log_id.clone();
            Arc::new(move |err: &RingError| error!("{log_id} {err}"))
        };

        ErrorSink {
            log_id,
            callback: Mutex::new(callback),
        }
    }

    pub(crate) fn log_id(&self) -> &str {
        &self.log_id
    }

    pub(crate) fn set(&self, callback: ErrorCallback) {
        *lock(&self.callback) = callback;
    }

    pub(crate) fn report(&self, err: &RingError) {
        // Clone out of the lock: the callback may replace itself.
        let callback = lock(&self.callback).clone();
        callback(err);
    }
}

/// Largest power of two not greater than `n`, or 0.
pub(crate) fn pow2_floor(n: usize) -> usize {
    match n {
        0 => 0,
        n => 1 << (usize::BITS - 1 - n.leading_zeros()),
    }
}

/// Checks that a producer is at most `capacity` entries ahead of its consumer.
pub(crate) fn check_indices(prod: u32, cons: u32, capacity: u32) -> Result<u32, RingError> {
    let pending = prod.wrapping_sub(cons);

    if pending > capacity {
        return Err(RingError::IndexOverflow {
            prod,
            cons,
            capacity,
        });
    }

    Ok(pending)
}

/// The `RING_PUSH_RESPONSES_AND_CHECK_NOTIFY` test: the peer asked for an event at an index in
/// `(old, new]`.
pub(crate) fn need_notify(old: u32, new: u32, event: u32) -> bool {
    new.wrapping_sub(event) < new.wrapping_sub(old)
}
