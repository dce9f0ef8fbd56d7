// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(missing_docs)]

//! In-memory implementations of the Xen primitives, and the frontend side of the rings, used to
//! exercise the backend core without a hypervisor.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub mod mock_domains;
pub mod mock_evtchn;
pub mod mock_gnttab;
pub mod mock_store;
pub mod test_frontend;
pub mod test_protocol;

pub use self::mock_domains::MockDomains;
pub use self::mock_evtchn::MockEvtchn;
pub use self::mock_gnttab::{MockGnttab, MockPage};
pub use self::mock_store::MockXenStore;
pub use self::test_frontend::{
    FrontendDevice, HookCounters, TestFrontend, TestFrontendFactory,
};
pub use self::test_protocol::{
    checksum, test_event, test_request, EventReader, FrontRing, TestEvent, TestHandler,
    TestRequest, TestResponse, TEST_FAIL_ID,
};
use crate::xen::{XenInterface, XenStore};

/// Mocks behind a [`XenInterface`], kept around so tests can drive the frontend side.
#[derive(Debug, Clone)]
pub struct MockXen {
    pub xen: XenInterface,
    pub store: Arc<MockXenStore>,
    pub domains: Arc<MockDomains>,
    pub evtchn: Arc<MockEvtchn>,
    pub gnttab: Arc<MockGnttab>,
}

/// Creates a set of mocks where domain 0 runs the backend.
pub fn mock_xen_interface() -> MockXen {
    let store = Arc::new(MockXenStore::new());
    let domains = Arc::new(MockDomains::new(&[0]));
    let evtchn = Arc::new(MockEvtchn::new());
    let gnttab = Arc::new(MockGnttab::new());

    store.write_string("domid", "0").unwrap();

    MockXen {
        xen: XenInterface {
            store: store.clone(),
            domains: domains.clone(),
            evtchn: evtchn.clone(),
            gnttab: gnttab.clone(),
        },
        store,
        domains,
        evtchn,
        gnttab,
    }
}

/// Polls `condition` until it holds or `timeout` expires. Returns the last result.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;

    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
