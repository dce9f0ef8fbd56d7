// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{FrontRing, MockXen, MockXenStore, TestHandler, TestRequest, TestResponse};
use crate::backend::FrontendFactory;
use crate::frontend::{BindContext, FrontendError, FrontendHandler};
use crate::ring::InRing;
use crate::xen::{DevId, DomId, EvtchnPort, GrantRef, XenStore, XenbusState};

/// How many times the [`TestFrontend`] hooks ran.
#[derive(Debug, Default)]
pub struct HookCounters {
    pub binds: AtomicUsize,
    pub closings: AtomicUsize,
}

/// Serves one [`TestHandler`] ring published by the frontend as `ring-ref` and
/// `event-channel`.
#[derive(Debug)]
pub struct TestFrontend {
    counters: Arc<HookCounters>,
}

impl TestFrontend {
    pub fn new(counters: Arc<HookCounters>) -> Self {
        TestFrontend { counters }
    }
}

impl FrontendHandler for TestFrontend {
    fn on_bind(&mut self, ctx: &mut BindContext<'_>) -> Result<(), FrontendError> {
        self.counters.binds.fetch_add(1, Ordering::SeqCst);

        let ring_ref = ctx.read_frontend_uint("ring-ref")?;
        let port = ctx.read_frontend_uint("event-channel")?;

        let ring = InRing::new(
            ctx.xen(),
            ctx.dom_id(),
            port,
            ring_ref,
            TestHandler::default(),
        )?;

        ctx.write_backend_string("feature-test", "1")?;
        ctx.add_ring_channel(Arc::new(ring))
    }

    fn on_closing(&mut self) {
        self.counters.closings.fetch_add(1, Ordering::SeqCst);
    }
}

/// Creates [`TestFrontend`]s sharing one set of counters.
#[derive(Debug, Default)]
pub struct TestFrontendFactory {
    pub counters: Arc<HookCounters>,
    created: AtomicUsize,
    fail: AtomicBool,
}

impl TestFrontendFactory {
    pub fn new() -> Self {
        TestFrontendFactory::default()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Makes the next creations fail until reset.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl FrontendFactory for TestFrontendFactory {
    fn create_frontend(
        &self,
        dom_id: DomId,
        dev_id: DevId,
    ) -> Result<Box<dyn FrontendHandler>, FrontendError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FrontendError::Setup(format!(
                "no frontend for {dom_id}/{dev_id}"
            )));
        }

        self.created.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(TestFrontend::new(self.counters.clone())))
    }
}

/// The guest side of one device: its store entries and its end of the ring.
#[derive(Debug)]
pub struct FrontendDevice {
    pub dom_id: DomId,
    pub dev_id: DevId,
    pub path: String,
    pub backend_path: String,
    pub ring_ref: GrantRef,
    pub remote_port: EvtchnPort,
    pub ring: FrontRing<TestRequest, TestResponse>,
    store: Arc<MockXenStore>,
}

impl FrontendDevice {
    /// Starts domain `dom_id` and publishes device `dev_id` of class `device_name`, served by
    /// domain `be_dom_id`, in the `Unknown` state.
    pub fn new(
        mock: &MockXen,
        device_name: &str,
        be_dom_id: DomId,
        dom_id: DomId,
        dev_id: DevId,
    ) -> Self {
        mock.domains.add(dom_id);

        let path = format!("/local/domain/{dom_id}/device/{device_name}/{dev_id}");
        let backend_path =
            format!("/local/domain/{be_dom_id}/backend/{device_name}/{dom_id}/{dev_id}");
        let ring_ref = GrantRef::from(dev_id) + 1;
        let remote_port = EvtchnPort::from(dev_id) + 1;

        let ring = FrontRing::new(mock.gnttab.grant(dom_id, ring_ref));

        let store = &mock.store;
        store
            .write_string(&format!("{path}/backend"), &backend_path)
            .unwrap();
        store
            .write_int(&format!("{path}/backend-id"), i64::from(be_dom_id))
            .unwrap();
        store
            .write_int(&format!("{path}/ring-ref"), i64::from(ring_ref))
            .unwrap();
        store
            .write_int(&format!("{path}/event-channel"), i64::from(remote_port))
            .unwrap();
        store
            .write_int(
                &format!("{path}/state"),
                i64::from(XenbusState::Unknown.value()),
            )
            .unwrap();

        FrontendDevice {
            dom_id,
            dev_id,
            path,
            backend_path,
            ring_ref,
            remote_port,
            ring,
            store: mock.store.clone(),
        }
    }

    pub fn state_path(&self) -> String {
        format!("{}/state", self.path)
    }

    pub fn backend_state_path(&self) -> String {
        format!("{}/state", self.backend_path)
    }

    pub fn set_state(&self, state: XenbusState) {
        self.store
            .write_int(&self.state_path(), i64::from(state.value()))
            .unwrap();
    }

    /// Removes the device directory, as the toolstack does on unplug.
    pub fn unplug(&self) {
        self.store.remove(&self.path).unwrap();
    }

    /// Backend state currently published, if valid.
    pub fn backend_state(&self) -> Option<XenbusState> {
        self.store
            .read(&self.backend_state_path())
            .and_then(|value| value.parse().ok())
    }

    /// Every backend state published so far, oldest first.
    pub fn backend_state_history(&self) -> Vec<XenbusState> {
        self.store
            .write_history(&self.backend_state_path())
            .iter()
            .filter_map(|value| value.parse().ok())
            .collect()
    }

    /// Backend end of the event channel, once bound.
    pub fn local_port(&self, mock: &MockXen) -> Option<EvtchnPort> {
        mock.evtchn.local_port(self.dom_id, self.remote_port)
    }
}
