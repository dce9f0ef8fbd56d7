// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interfaces to the Xen host primitives the backend core is built on.
//!
//! Each primitive is a trait so the core never depends on a concrete binding: production code
//! plugs thin wrappers over libxenstore, libxenevtchn, libxengnttab and libxenctrl, tests plug
//! the in-memory implementations from [`crate::test_utils`].

/// Enumeration of running domains.
pub mod domains;
/// Interdomain event channels.
pub mod evtchn;
/// Grant table mappings of foreign pages.
pub mod gnttab;
/// The xenbus connection state values.
pub mod state;
/// Configuration store access and watches.
pub mod store;

use std::fmt;
use std::sync::Arc;

pub use self::domains::{DomainEntry, DomainInfo, DomainInfoError};
pub use self::evtchn::{EventChannelFactory, EventChannelHandle, EvtchnError, XenEvtchn};
pub use self::gnttab::{GrantBuffer, GrantError, GrantMapper};
pub use self::state::{InvalidXenbusState, XenbusState};
pub use self::store::{WatchCallback, XenStore, XenStoreError};

/// Domain identifier.
pub type DomId = u16;
/// Device instance identifier, the `<devid>` component of the xenstore device paths.
pub type DevId = u16;
/// Event channel port number.
pub type EvtchnPort = u32;
/// Grant table reference.
pub type GrantRef = u32;

/// Size of a Xen page, the granularity of grant mappings.
pub const XEN_PAGE_SIZE: usize = 4096;

/// Bundle of the host primitives handed to every component at construction time.
#[derive(Clone)]
pub struct XenInterface {
    /// Configuration store.
    pub store: Arc<dyn XenStore>,
    /// Domain enumeration.
    pub domains: Arc<dyn DomainInfo>,
    /// Event channel handles.
    pub evtchn: Arc<dyn EventChannelFactory>,
    /// Grant reference mapping.
    pub gnttab: Arc<dyn GrantMapper>,
}

impl fmt::Debug for XenInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XenInterface").finish_non_exhaustive()
    }
}

/// Prefix used in log lines to identify a frontend.
pub fn log_dom_id(dom_id: DomId, dev_id: DevId) -> String {
    format!("Dom({dom_id}/{dev_id})")
}
