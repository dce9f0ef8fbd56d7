// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frontend discovery.
//!
//! A [`Backend`] serves one device class. Each tick lists the devices every foreign domain
//! publishes under `device/<class>`, creates a [`FrontendConnection`] for each new one and
//! reaps the connections that terminated or whose frontend went away.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, error, info, warn};
use utils::lock;
use utils::timer::{Timer, TimerError};

use crate::config::{BackendConfig, ConfigError};
use crate::frontend::{FrontendConnection, FrontendError, FrontendHandler};
use crate::xen::{
    log_dom_id, DevId, DomId, DomainInfoError, XenInterface, XenStoreError, XenbusState,
};

/// Store key holding the id of the domain the backend runs in.
pub const DOMID_KEY: &str = "domid";

/// Errors associated with [`Backend`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum BackendError {
    /// Invalid configuration: {0}
    Config(#[from] ConfigError),
    /// Cannot read own domain id: {0}
    DomId(XenStoreError),
    /// Own domain id {0} is out of range
    InvalidDomId(i64),
    /// Discovery timer error: {0}
    Timer(#[from] TimerError),
    /// Cannot list domains: {0}
    Domains(#[from] DomainInfoError),
    /// Frontend error: {0}
    Frontend(#[from] FrontendError),
}

/// Creates the client hooks of each new frontend device.
pub trait FrontendFactory: Send + Sync {
    /// Called once for device `dev_id` of domain `dom_id` before its connection is created.
    /// An error skips the device for this tick.
    fn create_frontend(
        &self,
        dom_id: DomId,
        dev_id: DevId,
    ) -> Result<Box<dyn FrontendHandler>, FrontendError>;
}

type Registry = BTreeMap<(DomId, DevId), FrontendConnection>;

struct Inner {
    device_name: String,
    dom_id: DomId,
    xen: XenInterface,
    factory: Box<dyn FrontendFactory>,
    frontends: Mutex<Registry>,
}

impl Inner {
    fn check_frontends(&self) {
        let mut frontends = lock(&self.frontends);

        let dom_ids = match self.xen.domains.existing_domains() {
            Ok(dom_ids) => dom_ids,
            Err(err) => {
                error!("{err}");
                return;
            }
        };

        for dom_id in dom_ids.iter().copied().filter(|dom_id| *dom_id != self.dom_id) {
            if let Err(err) = self.check_new_frontends(&mut frontends, dom_id) {
                debug!("Dom({dom_id}) {err}");
            }
        }

        self.reap_frontends(&mut frontends, &dom_ids);
    }

    fn check_new_frontends(
        &self,
        frontends: &mut Registry,
        dom_id: DomId,
    ) -> Result<(), XenStoreError> {
        let device_path = format!(
            "{}/device/{}",
            self.xen.store.domain_path(dom_id)?,
            self.device_name
        );

        for entry in self.xen.store.read_directory(&device_path)? {
            let dev_id = match entry.parse::<DevId>() {
                Ok(dev_id) => dev_id,
                Err(err) => {
                    warn!("Dom({dom_id}) invalid device id {entry:?}: {err}");
                    continue;
                }
            };

            if frontends.contains_key(&(dom_id, dev_id)) {
                continue;
            }

            if !self.xen.store.exists(&format!("{device_path}/{entry}/state")) {
                continue;
            }

            match self.create_frontend(dom_id, dev_id) {
                Ok(connection) => {
                    frontends.insert((dom_id, dev_id), connection);
                }
                Err(err) => error!(
                    "{} cannot create frontend: {err}",
                    log_dom_id(dom_id, dev_id)
                ),
            }
        }

        Ok(())
    }

    fn create_frontend(
        &self,
        dom_id: DomId,
        dev_id: DevId,
    ) -> Result<FrontendConnection, FrontendError> {
        info!("{} create frontend", log_dom_id(dom_id, dev_id));

        let handler = self.factory.create_frontend(dom_id, dev_id)?;

        FrontendConnection::new(
            &self.device_name,
            self.xen.clone(),
            self.dom_id,
            dom_id,
            dev_id,
            handler,
        )
    }

    fn reap_frontends(&self, frontends: &mut Registry, dom_ids: &[DomId]) {
        frontends.retain(|(dom_id, dev_id), connection| {
            let departed = !dom_ids.contains(dom_id)
                || !self
                    .xen
                    .store
                    .exists(&format!("{}/state", connection.frontend_path()));

            if !departed && !connection.is_terminated() {
                return true;
            }

            info!("{} delete frontend", log_dom_id(*dom_id, *dev_id));

            connection.close();

            false
        });
    }

    fn close_all(&self) {
        let frontends = std::mem::take(&mut *lock(&self.frontends));

        for (_, connection) in frontends {
            connection.close();
        }
    }
}

/// Discovers the frontends of one device class and owns their connections.
pub struct Backend {
    inner: Arc<Inner>,
    timer: Timer,
    finished: Mutex<bool>,
    cond_var: Condvar,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("device_name", &self.inner.device_name)
            .field("dom_id", &self.inner.dom_id)
            .field("frontends", &lock(&self.inner.frontends).keys())
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Creates a stopped backend for `config.device_name`.
    ///
    /// The backend domain id is `config.dom_id` or, when unset, the store key [`DOMID_KEY`].
    pub fn new(
        config: &BackendConfig,
        xen: XenInterface,
        factory: Box<dyn FrontendFactory>,
    ) -> Result<Self, BackendError> {
        config.validate()?;

        let dom_id = match config.dom_id {
            Some(dom_id) => dom_id,
            None => {
                let value = xen.store.read_int(DOMID_KEY).map_err(BackendError::DomId)?;
                DomId::try_from(value).map_err(|_| BackendError::InvalidDomId(value))?
            }
        };

        info!(
            "Create backend {}, dom id: {dom_id}, poll interval: {:?}",
            config.device_name,
            config.poll_interval()
        );

        let inner = Arc::new(Inner {
            device_name: config.device_name.clone(),
            dom_id,
            xen,
            factory,
            frontends: Mutex::new(BTreeMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        let timer = Timer::new(
            &config.device_name,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.check_frontends();
                }
            }),
            config.poll_interval(),
            true,
        );

        Ok(Backend {
            inner,
            timer,
            finished: Mutex::new(true),
            cond_var: Condvar::new(),
        })
    }

    /// Starts periodic discovery.
    pub fn start(&self) -> Result<(), BackendError> {
        debug!("Start backend {}", self.inner.device_name);
        let mut finished = lock(&self.finished);
        self.timer.start()?;
        *finished = false;
        Ok(())
    }

    /// Stops periodic discovery and wakes [`Backend::wait_for_finish`]. The existing
    /// connections keep running.
    pub fn stop(&self) {
        debug!("Stop backend {}", self.inner.device_name);
        let mut finished = lock(&self.finished);
        self.timer.stop();
        *finished = true;
        self.cond_var.notify_all();
    }

    /// Blocks until the backend is stopped. Returns at once if it is not started.
    pub fn wait_for_finish(&self) {
        let mut finished = lock(&self.finished);

        while !*finished {
            finished = match self.cond_var.wait(finished) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Returns `true` while periodic discovery runs.
    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    /// Runs one discovery pass.
    pub fn check_frontends(&self) {
        self.inner.check_frontends();
    }

    /// Domain the backend runs in.
    pub fn dom_id(&self) -> DomId {
        self.inner.dom_id
    }

    /// Device class served.
    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    /// Number of connections currently owned.
    pub fn frontend_count(&self) -> usize {
        lock(&self.inner.frontends).len()
    }

    /// Returns `true` if a connection to device `dev_id` of `dom_id` exists.
    pub fn has_frontend(&self, dom_id: DomId, dev_id: DevId) -> bool {
        lock(&self.inner.frontends).contains_key(&(dom_id, dev_id))
    }

    /// Last state reported by frontend `dev_id` of `dom_id`, if connected to it.
    pub fn frontend_state(&self, dom_id: DomId, dev_id: DevId) -> Option<XenbusState> {
        lock(&self.inner.frontends)
            .get(&(dom_id, dev_id))
            .map(FrontendConnection::frontend_state)
    }

    /// State published towards frontend `dev_id` of `dom_id`, if connected to it.
    pub fn backend_state(&self, dom_id: DomId, dev_id: DevId) -> Option<XenbusState> {
        lock(&self.inner.frontends)
            .get(&(dom_id, dev_id))
            .map(FrontendConnection::backend_state)
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.timer.stop();
        self.inner.close_all();
    }
}
