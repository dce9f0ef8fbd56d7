// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::tests_outside_test_module)]

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use xenbe::backend::{Backend, FrontendFactory};
use xenbe::config::BackendConfig;
use xenbe::frontend::{BindContext, FrontendError, FrontendHandler};
use xenbe::ring::{InRing, OutRing, RingChannel, DEFAULT_EVENT_OFFSET};
use xenbe::test_utils::{
    checksum, mock_xen_interface, test_event, test_request, wait_until, EventReader,
    FrontRing, FrontendDevice, MockXen, TestEvent, TestFrontendFactory, TestHandler,
    TestRequest, TestResponse,
};
use xenbe::xen::{DevId, DomId, XenStore, XenbusState};

const DEVICE: &str = "vtest";
const TIMEOUT: Duration = Duration::from_secs(5);

struct Factory(Arc<TestFrontendFactory>);

impl FrontendFactory for Factory {
    fn create_frontend(
        &self,
        dom_id: DomId,
        dev_id: DevId,
    ) -> Result<Box<dyn FrontendHandler>, FrontendError> {
        self.0.create_frontend(dom_id, dev_id)
    }
}

fn create_backend(mock: &MockXen) -> (Arc<TestFrontendFactory>, Backend) {
    let factory = Arc::new(TestFrontendFactory::new());
    let backend = Backend::new(
        &BackendConfig::new(DEVICE),
        mock.xen.clone(),
        Box::new(Factory(factory.clone())),
    )
    .unwrap();

    (factory, backend)
}

fn wait_backend_state(device: &FrontendDevice, state: XenbusState) -> bool {
    wait_until(TIMEOUT, || device.backend_state() == Some(state))
}

fn connect(device: &FrontendDevice) {
    device.set_state(XenbusState::Initialising);
    assert!(wait_backend_state(device, XenbusState::InitWait));
    device.set_state(XenbusState::Initialised);
    assert!(wait_backend_state(device, XenbusState::Connected));
}

#[test]
fn test_handshake_scenario() {
    let mock = mock_xen_interface();
    let (factory, backend) = create_backend(&mock);
    let device = FrontendDevice::new(&mock, DEVICE, 0, 5, 12);

    backend.check_frontends();
    assert!(backend.has_frontend(5, 12));
    assert_eq!(device.backend_path, "/local/domain/0/backend/vtest/5/12");
    assert!(wait_backend_state(&device, XenbusState::Initialising));

    device.set_state(XenbusState::Initialising);
    assert!(wait_backend_state(&device, XenbusState::InitWait));

    device.set_state(XenbusState::Initialised);
    assert!(wait_backend_state(&device, XenbusState::Connected));
    assert_eq!(factory.counters.binds.load(Ordering::SeqCst), 1);
    assert_eq!(
        mock.store
            .read(&format!("{}/feature-test", device.backend_path))
            .as_deref(),
        Some("1")
    );

    device.set_state(XenbusState::Closing);
    assert!(wait_backend_state(&device, XenbusState::Closed));
    assert_eq!(factory.counters.closings.load(Ordering::SeqCst), 1);

    assert_eq!(
        device.backend_state_history(),
        vec![
            XenbusState::Initialising,
            XenbusState::InitWait,
            XenbusState::Connected,
            XenbusState::Closing,
            XenbusState::Closed
        ]
    );

    // Terminated connections are reaped on the next tick.
    backend.check_frontends();
    assert!(!backend.has_frontend(5, 12));
}

#[test]
fn test_frontend_restart() {
    let mock = mock_xen_interface();
    let (factory, backend) = create_backend(&mock);
    let device = FrontendDevice::new(&mock, DEVICE, 0, 5, 0);

    backend.check_frontends();
    connect(&device);

    device.set_state(XenbusState::Initialising);
    assert!(wait_backend_state(&device, XenbusState::InitWait));

    let history = device.backend_state_history();
    assert_eq!(
        history[history.len() - 3..],
        [
            XenbusState::Closing,
            XenbusState::Closed,
            XenbusState::InitWait
        ]
    );
    assert_eq!(factory.counters.closings.load(Ordering::SeqCst), 1);

    // A restarted connection is kept by discovery.
    backend.check_frontends();
    assert!(backend.has_frontend(5, 0));

    device.set_state(XenbusState::Initialised);
    assert!(wait_backend_state(&device, XenbusState::Connected));
    assert_eq!(factory.counters.binds.load(Ordering::SeqCst), 2);
}

#[test]
fn test_request_round_trip() {
    let mock = mock_xen_interface();
    let (_, backend) = create_backend(&mock);
    let mut device = FrontendDevice::new(&mock, DEVICE, 0, 5, 0);

    backend.check_frontends();
    connect(&device);

    let port = device.local_port(&mock).unwrap();
    let mut responses = Vec::new();
    let mut seq = 0;

    // More requests than ring slots, in batches.
    for _ in 0..4 {
        let batch = 20;
        for _ in 0..batch {
            device.ring.push_request(&test_request(7, seq));
            seq += 1;
        }
        mock.evtchn.signal(port);

        let expected = responses.len() + batch;
        assert!(wait_until(TIMEOUT, || {
            responses.extend(device.ring.take_responses());
            responses.len() == expected
        }));
    }

    for (seq, response) in (0u32..).zip(&responses) {
        assert_eq!(response.seq, seq);
        assert_eq!(response.status, 0);
        assert_eq!(response.u32data, checksum(&test_request(7, seq)));
    }

    assert!(mock.evtchn.notify_count(port) > 0);
    assert_eq!(backend.backend_state(5, 0), Some(XenbusState::Connected));
}

#[test]
fn test_ring_corruption_closes_connection() {
    let mock = mock_xen_interface();
    let (_, backend) = create_backend(&mock);
    let device = FrontendDevice::new(&mock, DEVICE, 0, 5, 0);

    backend.check_frontends();
    connect(&device);

    let port = device.local_port(&mock).unwrap();
    device.ring.set_req_prod(1000);
    mock.evtchn.signal(port);

    assert!(wait_backend_state(&device, XenbusState::Closed));
    assert_eq!(mock.evtchn.bound_count(), 0);
    assert_eq!(mock.gnttab.mapped_count(), 0);

    backend.check_frontends();
    assert!(!backend.has_frontend(5, 0));
}

#[test]
fn test_stop_during_request() {
    let mock = mock_xen_interface();
    let page = mock.gnttab.grant(5, 1);
    let mut front = FrontRing::<TestRequest, TestResponse>::new(page);

    let handler = TestHandler::with_delay(Duration::from_millis(100));
    let processed = handler.processed();
    let ring = InRing::new(&mock.xen, 5, 1, 1, handler).unwrap();
    ring.start().unwrap();

    for seq in 0..4 {
        front.push_request(&test_request(1, seq));
    }
    mock.evtchn.signal(mock.evtchn.local_port(5, 1).unwrap());
    thread::sleep(Duration::from_millis(20));

    ring.stop();
    let after_stop = processed.load(Ordering::SeqCst);
    assert!(after_stop < 4);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(processed.load(Ordering::SeqCst), after_stop);
    assert!(!ring.is_terminated());
}

#[test]
fn test_concurrent_discovery() {
    let mock = mock_xen_interface();
    let (factory, backend) = create_backend(&mock);
    let devices: Vec<_> = (1..=4)
        .map(|dom_id| FrontendDevice::new(&mock, DEVICE, 0, dom_id, 0))
        .collect();

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| backend.check_frontends());
        }
    });

    assert_eq!(backend.frontend_count(), devices.len());
    assert_eq!(factory.created(), devices.len());
}

#[test]
fn test_departure() {
    let mock = mock_xen_interface();
    let (_, backend) = create_backend(&mock);
    let first = FrontendDevice::new(&mock, DEVICE, 0, 5, 0);
    let second = FrontendDevice::new(&mock, DEVICE, 0, 6, 0);

    backend.check_frontends();
    connect(&first);
    connect(&second);
    assert_eq!(mock.evtchn.bound_count(), 2);

    mock.domains.remove(5);
    second.unplug();
    backend.check_frontends();

    assert_eq!(backend.frontend_count(), 0);
    assert_eq!(first.backend_state(), Some(XenbusState::Closed));
    assert_eq!(second.backend_state(), Some(XenbusState::Closed));
    assert_eq!(mock.evtchn.bound_count(), 0);
    assert_eq!(mock.gnttab.mapped_count(), 0);
    assert_eq!(mock.store.watch_count(), 0);
}

/// Serves requests and publishes one event per request on a second page.
struct EventFrontend {
    events: Arc<Mutex<Option<Arc<OutRing<TestEvent>>>>>,
}

impl FrontendHandler for EventFrontend {
    fn on_bind(&mut self, ctx: &mut BindContext<'_>) -> Result<(), FrontendError> {
        let ring = InRing::new(
            ctx.xen(),
            ctx.dom_id(),
            ctx.read_frontend_uint("event-channel")?,
            ctx.read_frontend_uint("ring-ref")?,
            TestHandler::default(),
        )?;
        ctx.add_ring_channel(Arc::new(ring))?;

        let events = Arc::new(OutRing::new(
            ctx.xen(),
            ctx.dom_id(),
            ctx.read_frontend_uint("evt-channel")?,
            ctx.read_frontend_uint("evt-ref")?,
            DEFAULT_EVENT_OFFSET,
        )?);
        ctx.add_ring_channel(events.clone())?;

        *self.events.lock().unwrap() = Some(events);

        Ok(())
    }

    fn on_closing(&mut self) {
        self.events.lock().unwrap().take();
    }
}

struct EventFactory(Arc<Mutex<Option<Arc<OutRing<TestEvent>>>>>);

impl FrontendFactory for EventFactory {
    fn create_frontend(
        &self,
        _dom_id: DomId,
        _dev_id: DevId,
    ) -> Result<Box<dyn FrontendHandler>, FrontendError> {
        Ok(Box::new(EventFrontend {
            events: self.0.clone(),
        }))
    }
}

#[test]
fn test_events() {
    let mock = mock_xen_interface();
    let events = Arc::new(Mutex::new(None));
    let backend = Backend::new(
        &BackendConfig::new(DEVICE),
        mock.xen.clone(),
        Box::new(EventFactory(events.clone())),
    )
    .unwrap();

    let device = FrontendDevice::new(&mock, DEVICE, 0, 5, 0);
    let mut reader =
        EventReader::<TestEvent>::new(mock.gnttab.grant(5, 50), DEFAULT_EVENT_OFFSET);
    mock.store
        .write_int(&format!("{}/evt-ref", device.path), 50)
        .unwrap();
    mock.store
        .write_int(&format!("{}/evt-channel", device.path), 50)
        .unwrap();

    backend.check_frontends();
    connect(&device);

    let out = events.lock().unwrap().clone().unwrap();
    for seq in 0..10 {
        out.send_event(&test_event(seq)).unwrap();
    }

    let received = reader.read_events();
    assert_eq!(received.len(), 10);
    assert!(received
        .iter()
        .zip(0u32..)
        .all(|(event, seq)| *event == test_event(seq)));
    assert_eq!(
        mock.evtchn
            .notify_count(mock.evtchn.local_port(5, 50).unwrap()),
        10
    );

    device.set_state(XenbusState::Closing);
    assert!(wait_backend_state(&device, XenbusState::Closed));
    assert!(events.lock().unwrap().is_none());

    // Clients holding a stopped channel get an error.
    out.send_event(&test_event(10)).unwrap_err();
}
