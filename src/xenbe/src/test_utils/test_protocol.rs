// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vm_memory::{ByteValued, Bytes};

use super::MockPage;
use crate::ring::{
    event_capacity, need_notify, sring_capacity, sring_entry_offset, HandlerError,
    RequestHandler, IN_CONS, IN_PROD, REQ_EVENT, REQ_PROD, RSP_EVENT, RSP_PROD,
};

/// Request id the [`TestHandler`] rejects.
pub const TEST_FAIL_ID: u32 = 0xdead;

/// Request record of the test protocol.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TestRequest {
    pub id: u32,
    pub seq: u32,
    pub data: [u32; 14],
}

// SAFETY: plain integers without padding.
unsafe impl ByteValued for TestRequest {}

/// Response record of the test protocol.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestResponse {
    pub status: i32,
    pub u32data: u32,
    pub seq: u32,
    pub reserved: [u8; 52],
}

// SAFETY: plain integers without padding.
unsafe impl ByteValued for TestResponse {}

/// Event record written to the test event page.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TestEvent {
    pub id: u32,
    pub seq: u32,
    pub data: [u32; 14],
}

// SAFETY: plain integers without padding.
unsafe impl ByteValued for TestEvent {}

pub fn test_request(id: u32, seq: u32) -> TestRequest {
    let mut request = TestRequest {
        id,
        seq,
        ..Default::default()
    };
    for (i, value) in (0u32..).zip(request.data.iter_mut()) {
        *value = seq.wrapping_mul(31).wrapping_add(i);
    }
    request
}

/// Value the [`TestHandler`] answers in `u32data`.
pub fn checksum(request: &TestRequest) -> u32 {
    request
        .data
        .iter()
        .fold(request.id ^ request.seq, |sum, value| sum.wrapping_add(*value))
}

pub fn test_event(seq: u32) -> TestEvent {
    TestEvent {
        id: 1,
        seq,
        data: [seq; 14],
    }
}

/// Answers each request with its checksum, optionally after a delay.
#[derive(Debug, Default)]
pub struct TestHandler {
    delay: Option<Duration>,
    processed: Arc<AtomicUsize>,
}

impl TestHandler {
    pub fn with_delay(delay: Duration) -> Self {
        TestHandler {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Counter of the requests answered so far.
    pub fn processed(&self) -> Arc<AtomicUsize> {
        self.processed.clone()
    }
}

impl RequestHandler for TestHandler {
    type Request = TestRequest;
    type Response = TestResponse;

    fn process_request(&mut self, request: &TestRequest) -> Result<TestResponse, HandlerError> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        if request.id == TEST_FAIL_ID {
            return Err(format!("invalid request id: {:#x}", request.id).into());
        }

        self.processed.fetch_add(1, Ordering::SeqCst);

        Ok(TestResponse {
            status: 0,
            u32data: checksum(request),
            seq: request.seq,
            reserved: [0; 52],
        })
    }
}

/// Frontend side of a request/response ring.
pub struct FrontRing<Req, Rsp> {
    page: Arc<MockPage>,
    capacity: u32,
    entry_size: usize,
    req_prod_pvt: u32,
    rsp_cons: u32,
    _records: PhantomData<(Req, Rsp)>,
}

impl<Req, Rsp> fmt::Debug for FrontRing<Req, Rsp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrontRing")
            .field("capacity", &self.capacity)
            .field("req_prod_pvt", &self.req_prod_pvt)
            .field("rsp_cons", &self.rsp_cons)
            .finish_non_exhaustive()
    }
}

impl<Req: ByteValued, Rsp: ByteValued> FrontRing<Req, Rsp> {
    /// Initializes the shared ring header on `page`.
    pub fn new(page: Arc<MockPage>) -> Self {
        let ring = page.as_volatile_slice();
        ring.store(0u32, REQ_PROD, Ordering::SeqCst).unwrap();
        ring.store(1u32, REQ_EVENT, Ordering::SeqCst).unwrap();
        ring.store(0u32, RSP_PROD, Ordering::SeqCst).unwrap();
        ring.store(1u32, RSP_EVENT, Ordering::SeqCst).unwrap();

        FrontRing {
            capacity: sring_capacity::<Req, Rsp>().unwrap(),
            entry_size: size_of::<Req>().max(size_of::<Rsp>()),
            page,
            req_prod_pvt: 0,
            rsp_cons: 0,
            _records: PhantomData,
        }
    }

    /// Publishes `request`. Returns `true` if the backend asked to be notified.
    pub fn push_request(&mut self, request: &Req) -> bool {
        let ring = self.page.as_volatile_slice();
        let offset = sring_entry_offset(self.req_prod_pvt, self.capacity, self.entry_size);
        ring.write_obj(*request, offset).unwrap();

        let old = self.req_prod_pvt;
        self.req_prod_pvt = old.wrapping_add(1);
        ring.store(self.req_prod_pvt, REQ_PROD, Ordering::Release)
            .unwrap();
        fence(Ordering::SeqCst);

        let event: u32 = ring.load(REQ_EVENT, Ordering::Relaxed).unwrap();
        need_notify(old, self.req_prod_pvt, event)
    }

    /// Consumes the responses published so far.
    pub fn take_responses(&mut self) -> Vec<Rsp> {
        let ring = self.page.as_volatile_slice();
        let prod: u32 = ring.load(RSP_PROD, Ordering::Acquire).unwrap();
        let mut responses = Vec::new();

        while self.rsp_cons != prod {
            let offset = sring_entry_offset(self.rsp_cons, self.capacity, self.entry_size);
            responses.push(ring.read_obj(offset).unwrap());
            self.rsp_cons = self.rsp_cons.wrapping_add(1);
        }

        ring.store(self.rsp_cons.wrapping_add(1), RSP_EVENT, Ordering::Release)
            .unwrap();

        responses
    }

    /// Overwrites the published request producer index.
    pub fn set_req_prod(&self, value: u32) {
        self.page
            .as_volatile_slice()
            .store(value, REQ_PROD, Ordering::Release)
            .unwrap();
    }
}

/// Frontend side of an event page.
pub struct EventReader<E> {
    page: Arc<MockPage>,
    offset: usize,
    capacity: u32,
    cons: u32,
    _records: PhantomData<E>,
}

impl<E> fmt::Debug for EventReader<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventReader")
            .field("offset", &self.offset)
            .field("capacity", &self.capacity)
            .field("cons", &self.cons)
            .finish_non_exhaustive()
    }
}

impl<E: ByteValued> EventReader<E> {
    /// Initializes the page indices. Records start at `offset`.
    pub fn new(page: Arc<MockPage>, offset: usize) -> Self {
        let ring = page.as_volatile_slice();
        ring.store(0u32, IN_CONS, Ordering::SeqCst).unwrap();
        ring.store(0u32, IN_PROD, Ordering::SeqCst).unwrap();

        EventReader {
            capacity: event_capacity(size_of::<E>(), offset).unwrap(),
            page,
            offset,
            cons: 0,
            _records: PhantomData,
        }
    }

    /// Consumes the events published so far.
    pub fn read_events(&mut self) -> Vec<E> {
        let ring = self.page.as_volatile_slice();
        let prod: u32 = ring.load(IN_PROD, Ordering::Acquire).unwrap();
        let mut events = Vec::new();

        while self.cons != prod {
            let slot = (self.cons % self.capacity) as usize;
            events.push(ring.read_obj(self.offset + slot * size_of::<E>()).unwrap());
            self.cons = self.cons.wrapping_add(1);
        }

        ring.store(self.cons, IN_CONS, Ordering::Release).unwrap();

        events
    }

    /// Overwrites the published consumer index.
    pub fn set_cons(&self, value: u32) {
        self.page
            .as_volatile_slice()
            .store(value, IN_CONS, Ordering::Release)
            .unwrap();
    }
}
