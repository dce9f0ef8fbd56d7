// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error};
use utils::epoll::EventSet;
use utils::poll_fd::PollFd;
use utils::{join_unless_current, lock};
use vm_memory::{ByteValued, Bytes, VolatileSlice};

use super::{
    check_indices, need_notify, pow2_floor, ChannelState, ErrorCallback, ErrorSink,
    HandlerError, RingChannel, RingError,
};
use crate::xen::{DomId, EvtchnPort, GrantBuffer, GrantRef, XenEvtchn, XenInterface, XEN_PAGE_SIZE};

// Shared ring header (`struct xen_sring_hdr`).
pub(crate) const REQ_PROD: usize = 0;
pub(crate) const REQ_EVENT: usize = 4;
pub(crate) const RSP_PROD: usize = 8;
pub(crate) const RSP_EVENT: usize = 12;

/// Size of the shared ring header, entries start right after it.
pub const SRING_HEADER_SIZE: usize = 64;

/// Processes the requests read from an [`InRing`].
pub trait RequestHandler: Send + 'static {
    /// Request record written by the frontend.
    type Request: ByteValued;
    /// Response record written back for each request.
    type Response: ByteValued;

    /// Turns one request into its response.
    ///
    /// Runs on the ring worker thread, one request at a time, in producer order. An error is
    /// fatal to the channel.
    fn process_request(&mut self, request: &Self::Request)
        -> Result<Self::Response, HandlerError>;
}

/// Number of request/response slots of a page shared by `Req` and `Rsp`.
pub(crate) fn sring_capacity<Req, Rsp>() -> Result<u32, RingError> {
    let entry_size = size_of::<Req>().max(size_of::<Rsp>());
    let invalid = RingError::InvalidLayout {
        record_size: entry_size,
        offset: SRING_HEADER_SIZE,
    };

    if entry_size == 0 {
        return Err(invalid);
    }

    match pow2_floor((XEN_PAGE_SIZE - SRING_HEADER_SIZE) / entry_size) {
        0 => Err(invalid),
        capacity => u32::try_from(capacity).map_err(|_| invalid),
    }
}

/// Offset of the slot used by `index`.
pub(crate) fn sring_entry_offset(index: u32, capacity: u32, entry_size: usize) -> usize {
    SRING_HEADER_SIZE + (index & (capacity - 1)) as usize * entry_size
}

struct Shared {
    sink: ErrorSink,
    // Declared before the event channel: it polls the channel's descriptor.
    poll: PollFd,
    evtchn: XenEvtchn,
    buffer: GrantBuffer,
    capacity: u32,
    entry_size: usize,
    stopping: AtomicBool,
    terminated: AtomicBool,
}

impl Shared {
    fn ring(&self) -> VolatileSlice<'_> {
        self.buffer.as_volatile_slice()
    }

    fn entry_offset(&self, index: u32) -> usize {
        sring_entry_offset(index, self.capacity, self.entry_size)
    }

    fn req_prod(&self) -> Result<u32, RingError> {
        Ok(self.ring().load(REQ_PROD, Ordering::Acquire)?)
    }

    fn fail(&self, err: &RingError) {
        self.terminated.store(true, Ordering::SeqCst);
        error!(
            "{} ring terminated, port: {}, ref: {}",
            self.sink.log_id(),
            self.evtchn.local_port(),
            self.buffer.grant_ref()
        );
        self.sink.report(err);
    }
}

/// Consumer side of the ring, owned by the worker thread.
struct Worker<H> {
    shared: Arc<Shared>,
    handler: H,
    req_cons: u32,
    rsp_prod_pvt: u32,
    rsp_published: u32,
}

impl<H: RequestHandler> Worker<H> {
    fn run(mut self) {
        debug!("{} ring thread started", self.shared.sink.log_id());

        loop {
            match self.shared.poll.poll() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    self.shared.fail(&err.into());
                    break;
                }
            }

            if let Err(err) = self.on_event() {
                if err.is_fatal() {
                    self.shared.fail(&err);
                    break;
                }
                self.shared.sink.report(&err);
            }
        }

        debug!("{} ring thread stopped", self.shared.sink.log_id());
    }

    fn on_event(&mut self) -> Result<(), RingError> {
        self.shared.evtchn.ack_pending()?;
        self.drain()
    }

    fn drain(&mut self) -> Result<(), RingError> {
        let shared = self.shared.clone();
        let ring = shared.ring();

        loop {
            let prod = shared.req_prod()?;
            check_indices(prod, self.req_cons, shared.capacity)?;

            while self.req_cons != prod {
                if shared.stopping.load(Ordering::Acquire) {
                    break;
                }

                let request: H::Request = ring.read_obj(shared.entry_offset(self.req_cons))?;
                self.req_cons = self.req_cons.wrapping_add(1);

                let response = self
                    .handler
                    .process_request(&request)
                    .map_err(RingError::Handler)?;

                ring.write_obj(response, shared.entry_offset(self.rsp_prod_pvt))?;
                self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
            }

            self.push_responses(&ring)?;

            if shared.stopping.load(Ordering::Acquire) {
                return Ok(());
            }

            // Ask for an event on the next request, then look again in case it raced with us.
            ring.store(self.req_cons.wrapping_add(1), REQ_EVENT, Ordering::Relaxed)?;
            fence(Ordering::SeqCst);

            if shared.req_prod()? == self.req_cons {
                return Ok(());
            }
        }
    }

    fn push_responses(&mut self, ring: &VolatileSlice<'_>) -> Result<(), RingError> {
        let old = self.rsp_published;
        let new = self.rsp_prod_pvt;

        if old == new {
            return Ok(());
        }

        ring.store(new, RSP_PROD, Ordering::Release)?;
        self.rsp_published = new;
        fence(Ordering::SeqCst);

        let event: u32 = ring.load(RSP_EVENT, Ordering::Relaxed)?;

        if need_notify(old, new, event) {
            if let Err(err) = self.shared.evtchn.notify() {
                let err = RingError::from(err);
                if err.is_fatal() {
                    return Err(err);
                }
                self.shared.sink.report(&err);
            }
        }

        Ok(())
    }
}

/// Request/response ring served by a dedicated worker thread.
pub struct InRing<H: RequestHandler> {
    shared: Arc<Shared>,
    handler: Mutex<Option<H>>,
    state: Mutex<ChannelState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<H: RequestHandler> fmt::Debug for InRing<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InRing")
            .field("evtchn", &self.shared.evtchn)
            .field("buffer", &self.shared.buffer)
            .field("capacity", &self.shared.capacity)
            .field("state", &*lock(&self.state))
            .finish_non_exhaustive()
    }
}

impl<H: RequestHandler> InRing<H> {
    /// Maps the ring page `grant_ref` of domain `dom_id` and binds to its `remote_port`.
    pub fn new(
        xen: &XenInterface,
        dom_id: DomId,
        remote_port: EvtchnPort,
        grant_ref: GrantRef,
        handler: H,
    ) -> Result<Self, RingError> {
        let capacity = sring_capacity::<H::Request, H::Response>()?;
        let entry_size = size_of::<H::Request>().max(size_of::<H::Response>());

        let buffer = GrantBuffer::new(xen.gnttab.clone(), dom_id, &[grant_ref])?;
        let evtchn = XenEvtchn::new(xen.evtchn.as_ref(), dom_id, remote_port)?;
        let poll = PollFd::new(evtchn.fd(), EventSet::IN)?;

        let log_id = format!("Dom({dom_id}) port {}:", evtchn.local_port());

        debug!("{log_id} create in ring, ref: {grant_ref}, capacity: {capacity}");

        Ok(InRing {
            shared: Arc::new(Shared {
                sink: ErrorSink::new(log_id),
                poll,
                evtchn,
                buffer,
                capacity,
                entry_size,
                stopping: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
            }),
            handler: Mutex::new(Some(handler)),
            state: Mutex::new(ChannelState::Idle),
            thread: Mutex::new(None),
        })
    }

    /// Number of request slots.
    pub fn capacity(&self) -> u32 {
        self.shared.capacity
    }
}

impl<H: RequestHandler> RingChannel for InRing<H> {
    fn start(&self) -> Result<(), RingError> {
        let mut state = lock(&self.state);

        if let Some(err) = state.start_error() {
            return Err(err);
        }

        let handler = lock(&self.handler).take().ok_or(RingError::Stopped)?;
        let worker = Worker {
            shared: self.shared.clone(),
            handler,
            req_cons: 0,
            rsp_prod_pvt: 0,
            rsp_published: 0,
        };

        let spawned = thread::Builder::new()
            .name(format!(
                "xenbe_ring {}:{}",
                self.shared.evtchn.dom_id(),
                self.shared.evtchn.local_port()
            ))
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                *lock(&self.thread) = Some(handle);
                *state = ChannelState::Running;
                Ok(())
            }
            Err(err) => {
                *state = ChannelState::Stopped;
                Err(RingError::Spawn(err))
            }
        }
    }

    fn stop(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ChannelState::Stopped {
                return;
            }
            *state = ChannelState::Stopped;
        }

        self.shared.stopping.store(true, Ordering::Release);

        if let Err(err) = self.shared.poll.cancel() {
            error!("{} {err}", self.shared.sink.log_id());
        }

        let thread = lock(&self.thread).take();

        if let Some(handle) = thread {
            join_unless_current(handle);
        }
    }

    fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    fn port(&self) -> EvtchnPort {
        self.shared.evtchn.local_port()
    }

    fn grant_ref(&self) -> GrantRef {
        self.shared.buffer.grant_ref()
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        self.shared.sink.set(callback);
    }
}

impl<H: RequestHandler> Drop for InRing<H> {
    fn drop(&mut self) {
        self.stop();
    }
}
