// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{debug, error};
use utils::lock;
use vm_memory::{ByteValued, Bytes};

use super::{check_indices, ChannelState, ErrorCallback, ErrorSink, RingChannel, RingError};
use crate::xen::{DomId, EvtchnPort, GrantBuffer, GrantRef, XenEvtchn, XenInterface, XEN_PAGE_SIZE};

// Event page header.
pub(crate) const IN_CONS: usize = 0;
pub(crate) const IN_PROD: usize = 4;

/// Default offset of the first event record in the page.
pub const DEFAULT_EVENT_OFFSET: usize = 64;

/// Number of `record_size` records fitting in a page after `offset`.
pub(crate) fn event_capacity(record_size: usize, offset: usize) -> Result<u32, RingError> {
    let invalid = RingError::InvalidLayout {
        record_size,
        offset,
    };

    if record_size == 0 || offset < IN_PROD + size_of::<u32>() || offset >= XEN_PAGE_SIZE {
        return Err(invalid);
    }

    match (XEN_PAGE_SIZE - offset) / record_size {
        0 => Err(invalid),
        capacity => u32::try_from(capacity).map_err(|_| invalid),
    }
}

#[derive(Debug)]
struct Producer {
    state: ChannelState,
    // Never read back from the page: the peer can write there.
    prod: u32,
}

/// Event page the backend writes records to.
pub struct OutRing<E> {
    sink: ErrorSink,
    producer: Mutex<Producer>,
    terminated: AtomicBool,
    offset: usize,
    capacity: u32,
    evtchn: XenEvtchn,
    buffer: GrantBuffer,
    _event: PhantomData<fn(E)>,
}

impl<E> fmt::Debug for OutRing<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutRing")
            .field("evtchn", &self.evtchn)
            .field("buffer", &self.buffer)
            .field("offset", &self.offset)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl<E: ByteValued> OutRing<E> {
    /// Maps the event page `grant_ref` of domain `dom_id` and binds to its `remote_port`.
    /// Records start at `offset` bytes into the page.
    pub fn new(
        xen: &XenInterface,
        dom_id: DomId,
        remote_port: EvtchnPort,
        grant_ref: GrantRef,
        offset: usize,
    ) -> Result<Self, RingError> {
        let capacity = event_capacity(size_of::<E>(), offset)?;

        let buffer = GrantBuffer::new(xen.gnttab.clone(), dom_id, &[grant_ref])?;
        let evtchn = XenEvtchn::new(xen.evtchn.as_ref(), dom_id, remote_port)?;

        let log_id = format!("Dom({dom_id}) port {}:", evtchn.local_port());

        debug!("{log_id} create out ring, ref: {grant_ref}, capacity: {capacity}");

        Ok(OutRing {
            sink: ErrorSink::new(log_id),
            producer: Mutex::new(Producer {
                state: ChannelState::Idle,
                prod: 0,
            }),
            terminated: AtomicBool::new(false),
            offset,
            capacity,
            evtchn,
            buffer,
            _event: PhantomData,
        })
    }

    /// Number of record slots.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Writes `event` to the page and notifies the frontend.
    ///
    /// Fails with [`RingError::RingFull`] if the frontend hasn't consumed enough records yet.
    /// Fatal errors are also reported to the error callback.
    pub fn send_event(&self, event: &E) -> Result<(), RingError> {
        let result = self.try_send(event);

        if let Err(err) = &result {
            if err.is_fatal() {
                lock(&self.producer).state = ChannelState::Stopped;
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

        result
    }

    fn try_send(&self, event: &E) -> Result<(), RingError> {
        let mut producer = lock(&self.producer);

        if let Some(err) = producer.state.use_error() {
            return Err(err);
        }

        let page = self.buffer.as_volatile_slice();
        let cons: u32 = page.load(IN_CONS, Ordering::Acquire)?;

        if check_indices(producer.prod, cons, self.capacity)? == self.capacity {
            return Err(RingError::RingFull);
        }

        let slot = (producer.prod % self.capacity) as usize;
        page.write_obj(*event, self.offset + slot * size_of::<E>())?;

        producer.prod = producer.prod.wrapping_add(1);
        page.store(producer.prod, IN_PROD, Ordering::Release)?;
        drop(producer);

        self.evtchn.notify()?;

        Ok(())
    }
}

impl<E: ByteValued> RingChannel for OutRing<E> {
    fn start(&self) -> Result<(), RingError> {
        let mut producer = lock(&self.producer);

        if let Some(err) = producer.state.start_error() {
            return Err(err);
        }

        producer.state = ChannelState::Running;

        Ok(())
    }

    fn stop(&self) {
        lock(&self.producer).state = ChannelState::Stopped;
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn port(&self) -> EvtchnPort {
        self.evtchn.local_port()
    }

    fn grant_ref(&self) -> GrantRef {
        self.buffer.grant_ref()
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        self.sink.set(callback);
    }
}

impl<E> Drop for OutRing<E> {
    fn drop(&mut self) {
        lock(&self.producer).state = ChannelState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::{mock_xen_interface, test_event, EventReader, MockXen, TestEvent};

    const FE_DOM: DomId = 3;
    const REMOTE_PORT: EvtchnPort = 9;
    const EVENT_REF: GrantRef = 77;

    fn setup() -> (MockXen, OutRing<TestEvent>, EventReader<TestEvent>) {
        let mock = mock_xen_interface();
        let page = mock.gnttab.grant(FE_DOM, EVENT_REF);
        let reader = EventReader::new(page, DEFAULT_EVENT_OFFSET);
        let ring = OutRing::new(
            &mock.xen,
            FE_DOM,
            REMOTE_PORT,
            EVENT_REF,
            DEFAULT_EVENT_OFFSET,
        )
        .unwrap();
        (mock, ring, reader)
    }

    #[test]
    fn test_event_capacity() {
        assert_eq!(event_capacity(64, 64).unwrap(), 63);
        assert_eq!(event_capacity(16, 128).unwrap(), 248);
        assert!(matches!(
            event_capacity(0, 64),
            Err(RingError::InvalidLayout { .. })
        ));
        assert!(matches!(
            event_capacity(64, 4),
            Err(RingError::InvalidLayout { .. })
        ));
        assert!(matches!(
            event_capacity(8192, 64),
            Err(RingError::InvalidLayout { .. })
        ));
    }

    #[test]
    fn test_send_requires_running() {
        let (_mock, ring, _reader) = setup();

        assert!(matches!(
            ring.send_event(&test_event(0)),
            Err(RingError::NotStarted)
        ));

        ring.start().unwrap();
        assert!(matches!(ring.start(), Err(RingError::AlreadyStarted)));
        ring.send_event(&test_event(0)).unwrap();

        ring.stop();
        assert!(matches!(
            ring.send_event(&test_event(1)),
            Err(RingError::Stopped)
        ));
        assert!(matches!(ring.start(), Err(RingError::Stopped)));
        assert!(!ring.is_terminated());
    }

    #[test]
    fn test_send_and_read() {
        let (mock, ring, mut reader) = setup();
        ring.start().unwrap();

        for seq in 0..10 {
            ring.send_event(&test_event(seq)).unwrap();
        }

        let events = reader.read_events();
        assert_eq!(events.len(), 10);
        for (seq, event) in events.iter().enumerate() {
            assert_eq!(event.seq as usize, seq);
        }
        // Notified on every event.
        assert_eq!(mock.evtchn.notify_count(ring.port()), 10);
    }

    #[test]
    fn test_ring_full() {
        let (_mock, ring, mut reader) = setup();
        ring.start().unwrap();

        for seq in 0..ring.capacity() {
            ring.send_event(&test_event(seq)).unwrap();
        }

        let err = ring.send_event(&test_event(100)).unwrap_err();
        assert!(matches!(err, RingError::RingFull));
        assert!(!err.is_fatal());
        assert!(!ring.is_terminated());

        // Wraps around once the frontend catches up.
        assert_eq!(reader.read_events().len(), 63);
        for seq in 0..100 {
            ring.send_event(&test_event(seq)).unwrap();
            assert_eq!(reader.read_events()[0].seq, seq);
        }
    }

    #[test]
    fn test_corrupted_consumer() {
        let (_mock, ring, reader) = setup();

        let reported = Arc::new(AtomicUsize::new(0));
        let counter = reported.clone();
        ring.set_error_callback(Arc::new(move |_: &RingError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        ring.start().unwrap();
        ring.send_event(&test_event(0)).unwrap();

        // Consumer ahead of the producer.
        reader.set_cons(500);

        assert!(matches!(
            ring.send_event(&test_event(1)),
            Err(RingError::IndexOverflow { .. })
        ));
        assert!(ring.is_terminated());
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_notify_errors() {
        let (mock, ring, _reader) = setup();
        ring.start().unwrap();

        mock.evtchn.fail_notify(Some(io::ErrorKind::WouldBlock));
        let err = ring.send_event(&test_event(0)).unwrap_err();
        assert!(!err.is_fatal());
        assert!(!ring.is_terminated());

        mock.evtchn.fail_notify(Some(io::ErrorKind::BrokenPipe));
        assert!(ring.send_event(&test_event(1)).unwrap_err().is_fatal());
        assert!(ring.is_terminated());
    }

    #[test]
    fn test_send_after_fatal_error() {
        let (mock, ring, mut reader) = setup();
        ring.start().unwrap();

        mock.evtchn.fail_notify(Some(io::ErrorKind::BrokenPipe));
        ring.send_event(&test_event(0)).unwrap_err();
        assert!(ring.is_terminated());

        // The channel stays dead once the notification path recovers.
        mock.evtchn.fail_notify(None);
        assert!(matches!(
            ring.send_event(&test_event(1)),
            Err(RingError::Stopped)
        ));
        assert!(matches!(ring.start(), Err(RingError::Stopped)));
        assert_eq!(reader.read_events().len(), 1);
    }

    #[test]
    fn test_drop_releases_resources() {
        let (mock, ring, _reader) = setup();
        assert_eq!(mock.gnttab.mapped_count(), 1);
        assert!(mock.evtchn.local_port(FE_DOM, REMOTE_PORT).is_some());

        drop(ring);
        assert_eq!(mock.gnttab.mapped_count(), 0);
        assert!(mock.evtchn.local_port(FE_DOM, REMOTE_PORT).is_none());
    }
}
