// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The xenbus handshake with one frontend device.
//!
//! A [`FrontendConnection`] publishes the backend state under the backend path, watches the
//! frontend state and drives the client [`FrontendHandler`] through the handshake:
//!
//! ```text
//!  backend          frontend
//!  Initialising  <- Initialising
//!  InitWait      <- Initialised        (on_bind creates the ring channels)
//!  Connected     <- Closing / Closed   (channels stopped)
//!  Closing, Closed
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, warn};
use utils::async_context::{AsyncContext, AsyncContextError};
use utils::lock;

use crate::ring::{RingChannel, RingError};
use crate::xen::{
    log_dom_id, DevId, DomId, InvalidXenbusState, XenInterface, XenStore, XenStoreError,
    XenbusState,
};

/// Errors associated with [`FrontendConnection`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum FrontendError {
    /// Xen store error: {0}
    XenStore(#[from] XenStoreError),
    /// Ring channel error: {0}
    Ring(#[from] RingError),
    /// Invalid state: {0}
    State(#[from] InvalidXenbusState),
    /// Async context error: {0}
    AsyncContext(#[from] AsyncContextError),
    /// Frontend setup failed: {0}
    Setup(String),
}

/// Client hooks of one frontend connection.
pub trait FrontendHandler: Send + 'static {
    /// Called once the frontend is initialised. Reads the frontend configuration and creates
    /// the ring channels with [`BindContext::add_ring_channel`].
    ///
    /// An error closes the connection.
    fn on_bind(&mut self, ctx: &mut BindContext<'_>) -> Result<(), FrontendError>;

    /// Called when the connection starts closing, before its channels are stopped.
    fn on_closing(&mut self) {}
}

/// What the frontend state watch does for a given (backend, frontend) state pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do.
    None,
    /// Move the backend to `InitWait`.
    InitWait,
    /// The frontend restarted while connected: close, then move to `InitWait`.
    Restart,
    /// Run the bind hook and move to `Connected`.
    Bind,
    /// Run the close sequence.
    Close,
}

/// Action for a frontend state change, given the current backend state.
pub fn next_action(backend: XenbusState, frontend: XenbusState) -> Action {
    use XenbusState::*;

    match (backend, frontend) {
        (Initialising | Closed, Initialising) => Action::InitWait,
        (Connected, Initialising) => Action::Restart,
        (Initialising | InitWait, Initialised | Connected) => Action::Bind,
        (Initialised | Connected, Closing | Closed) => Action::Close,
        _ => Action::None,
    }
}

/// Mutable part of a connection, guarded by one mutex.
struct ConnectionState {
    handler: Box<dyn FrontendHandler>,
    backend_state: XenbusState,
    frontend_state: XenbusState,
    channels: Vec<Arc<dyn RingChannel>>,
    torn_down: bool,
}

struct Shared {
    device_name: String,
    dom_id: DomId,
    dev_id: DevId,
    be_dom_id: DomId,
    log_id: String,
    frontend_path: String,
    backend_path: String,
    xen: XenInterface,
    state: Mutex<ConnectionState>,
    async_ctx: AsyncContext,
}

impl Shared {
    fn frontend_state_path(&self) -> String {
        format!("{}/state", self.frontend_path)
    }

    fn backend_state_path(&self) -> String {
        format!("{}/state", self.backend_path)
    }

    fn read_state(&self, path: &str) -> Option<XenbusState> {
        let value = match self.xen.store.read_string(path) {
            Ok(value) => value,
            Err(err) => {
                debug!("{} {err}", self.log_id);
                return None;
            }
        };

        match value.parse() {
            Ok(state) => Some(state),
            Err(err) => {
                warn!("{} {err}", self.log_id);
                None
            }
        }
    }

    fn set_backend_state(&self, state: &mut ConnectionState, backend_state: XenbusState) {
        if state.backend_state == backend_state {
            return;
        }

        info!("{} set backend state to: {backend_state}", self.log_id);

        state.backend_state = backend_state;

        if let Err(err) = self
            .xen
            .store
            .write_int(&self.backend_state_path(), i64::from(backend_state.value()))
        {
            error!("{} {err}", self.log_id);
        }
    }

    fn on_frontend_state_changed(self: &Arc<Self>) {
        let mut state = lock(&self.state);

        if state.torn_down {
            return;
        }

        let Some(frontend_state) = self.read_state(&self.frontend_state_path()) else {
            return;
        };

        if frontend_state == state.frontend_state {
            return;
        }

        info!("{} frontend state changed to: {frontend_state}", self.log_id);

        state.frontend_state = frontend_state;

        match next_action(state.backend_state, frontend_state) {
            Action::None => debug!(
                "{} no action, backend state: {}",
                self.log_id, state.backend_state
            ),
            Action::InitWait => self.set_backend_state(&mut state, XenbusState::InitWait),
            Action::Restart => {
                warn!("{} frontend restarted", self.log_id);
                self.close_channels(&mut state);
                self.set_backend_state(&mut state, XenbusState::InitWait);
            }
            Action::Bind => self.bind(&mut state),
            Action::Close => self.close_channels(&mut state),
        }
    }

    fn on_backend_state_changed(&self) {
        let mut state = lock(&self.state);

        if state.torn_down {
            return;
        }

        let Some(backend_state) = self.read_state(&self.backend_state_path()) else {
            return;
        };

        if state.backend_state == XenbusState::Connected && backend_state.is_closing_or_closed()
        {
            info!(
                "{} backend state externally changed to: {backend_state}",
                self.log_id
            );
            self.close_channels(&mut state);
        }
    }

    fn on_channel_error(&self) {
        let mut state = lock(&self.state);

        if state.torn_down || state.backend_state == XenbusState::Closed {
            return;
        }

        self.close_channels(&mut state);
    }

    fn bind(self: &Arc<Self>, state: &mut ConnectionState) {
        info!("{} on bind", self.log_id);

        let mut ctx = BindContext {
            shared: self,
            channels: &mut state.channels,
        };

        match state.handler.on_bind(&mut ctx) {
            Ok(()) => self.set_backend_state(state, XenbusState::Connected),
            Err(err) => {
                error!("{} bind failed: {err}", self.log_id);
                self.close_channels(state);
            }
        }
    }

    /// Moves to `Closing`, lets the client clean up, stops the channels and moves to `Closed`.
    fn close_channels(&self, state: &mut ConnectionState) {
        self.set_backend_state(state, XenbusState::Closing);

        state.handler.on_closing();

        for channel in state.channels.drain(..) {
            debug!(
                "{} stop channel, port: {}, ref: {}",
                self.log_id,
                channel.port(),
                channel.grant_ref()
            );
            channel.stop();
        }

        self.set_backend_state(state, XenbusState::Closed);
    }

    fn is_terminated(&self) -> bool {
        let state = lock(&self.state);

        if state.backend_state.is_closing_or_closed() {
            return true;
        }

        match state
            .channels
            .iter()
            .find(|channel| channel.is_terminated())
        {
            Some(channel) => {
                error!(
                    "{} channel terminated, port: {}, ref: {}",
                    self.log_id,
                    channel.port(),
                    channel.grant_ref()
                );
                true
            }
            None => false,
        }
    }
}

/// What [`FrontendHandler::on_bind`] can see and do.
pub struct BindContext<'a> {
    shared: &'a Arc<Shared>,
    channels: &'a mut Vec<Arc<dyn RingChannel>>,
}

impl fmt::Debug for BindContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindContext")
            .field("log_id", &self.shared.log_id)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl BindContext<'_> {
    /// Frontend domain id.
    pub fn dom_id(&self) -> DomId {
        self.shared.dom_id
    }

    /// Device instance id.
    pub fn dev_id(&self) -> DevId {
        self.shared.dev_id
    }

    /// Domain the backend runs in.
    pub fn backend_dom_id(&self) -> DomId {
        self.shared.be_dom_id
    }

    /// Device class.
    pub fn device_name(&self) -> &str {
        &self.shared.device_name
    }

    /// Frontend store directory.
    pub fn frontend_path(&self) -> &str {
        &self.shared.frontend_path
    }

    /// Backend store directory.
    pub fn backend_path(&self) -> &str {
        &self.shared.backend_path
    }

    /// Prefix identifying the connection in log lines.
    pub fn log_id(&self) -> &str {
        &self.shared.log_id
    }

    /// Xen primitives, to create ring channels with.
    pub fn xen(&self) -> &XenInterface {
        &self.shared.xen
    }

    /// The configuration store.
    pub fn store(&self) -> &dyn XenStore {
        self.shared.xen.store.as_ref()
    }

    /// Reads `key` of the frontend directory.
    pub fn read_frontend_string(&self, key: &str) -> Result<String, XenStoreError> {
        self.store()
            .read_string(&format!("{}/{key}", self.shared.frontend_path))
    }

    /// Reads the unsigned integer `key` of the frontend directory, e.g. a grant reference.
    pub fn read_frontend_uint(&self, key: &str) -> Result<u32, XenStoreError> {
        self.store()
            .read_uint(&format!("{}/{key}", self.shared.frontend_path))
    }

    /// Publishes `key` in the backend directory, e.g. a feature flag.
    pub fn write_backend_string(&self, key: &str, value: &str) -> Result<(), XenStoreError> {
        self.store()
            .write_string(&format!("{}/{key}", self.shared.backend_path), value)
    }

    /// Starts `channel` and hands it over to the connection. A fatal channel error closes the
    /// connection, and the channel is stopped when the connection closes.
    pub fn add_ring_channel(&mut self, channel: Arc<dyn RingChannel>) -> Result<(), FrontendError> {
        let weak = Arc::downgrade(self.shared);
        let log_id = self.shared.log_id.clone();

        channel.set_error_callback(Arc::new(move |err: &RingError| {
            if !err.is_fatal() {
                warn!("{log_id} {err}");
                return;
            }

            error!("{log_id} {err}");

            // Runs on the channel thread, which the close sequence joins.
            submit_channel_error(&weak);
        }));

        channel.start()?;

        debug!(
            "{} add channel, port: {}, ref: {}",
            self.shared.log_id,
            channel.port(),
            channel.grant_ref()
        );

        self.channels.push(channel);

        Ok(())
    }

    /// Number of channels added so far.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

fn submit_channel_error(weak: &Weak<Shared>) {
    let Some(shared) = weak.upgrade() else {
        return;
    };

    let target = weak.clone();
    if let Err(err) = shared.async_ctx.submit(move || {
        if let Some(shared) = target.upgrade() {
            shared.on_channel_error();
        }
    }) {
        debug!("{} {err}", shared.log_id);
    }
}

/// The backend end of the handshake with one frontend device.
pub struct FrontendConnection {
    shared: Arc<Shared>,
}

impl fmt::Debug for FrontendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrontendConnection")
            .field("log_id", &self.shared.log_id)
            .field("backend_path", &self.shared.backend_path)
            .field("frontend_path", &self.shared.frontend_path)
            .finish_non_exhaustive()
    }
}

impl FrontendConnection {
    /// Publishes the `Initialising` backend state for device `dev_id` of class `device_name` in
    /// domain `dom_id`, and starts watching both state nodes.
    pub fn new(
        device_name: &str,
        xen: XenInterface,
        be_dom_id: DomId,
        dom_id: DomId,
        dev_id: DevId,
        handler: Box<dyn FrontendHandler>,
    ) -> Result<Self, FrontendError> {
        let log_id = log_dom_id(dom_id, dev_id);

        let frontend_path = format!(
            "{}/device/{device_name}/{dev_id}",
            xen.store.domain_path(dom_id)?
        );
        let backend_path = format!(
            "{}/backend/{device_name}/{dom_id}/{dev_id}",
            xen.store.domain_path(be_dom_id)?
        );

        debug!("{log_id} frontend path: {frontend_path}, backend path: {backend_path}");

        let async_ctx = AsyncContext::new(&format!("{device_name} {dom_id}:{dev_id}"))?;

        let shared = Arc::new(Shared {
            device_name: device_name.to_string(),
            dom_id,
            dev_id,
            be_dom_id,
            log_id,
            frontend_path,
            backend_path,
            xen,
            state: Mutex::new(ConnectionState {
                handler,
                backend_state: XenbusState::Initialising,
                frontend_state: XenbusState::Unknown,
                channels: Vec::new(),
                torn_down: false,
            }),
            async_ctx,
        });

        // The connection tears itself down on drop if watching fails below.
        let connection = FrontendConnection { shared };
        let shared = &connection.shared;

        info!("{} set backend state to: {}", shared.log_id, XenbusState::Initialising);
        shared.xen.store.write_int(
            &shared.backend_state_path(),
            i64::from(XenbusState::Initialising.value()),
        )?;

        let weak = Arc::downgrade(shared);
        shared.xen.store.set_watch(
            &shared.frontend_state_path(),
            Arc::new(move |_: &str| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_frontend_state_changed();
                }
            }),
        )?;

        let weak = Arc::downgrade(shared);
        shared.xen.store.set_watch(
            &shared.backend_state_path(),
            Arc::new(move |_: &str| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_backend_state_changed();
                }
            }),
        )?;

        Ok(connection)
    }

    /// Frontend domain id.
    pub fn dom_id(&self) -> DomId {
        self.shared.dom_id
    }

    /// Device instance id.
    pub fn dev_id(&self) -> DevId {
        self.shared.dev_id
    }

    /// Frontend store directory.
    pub fn frontend_path(&self) -> &str {
        &self.shared.frontend_path
    }

    /// Backend store directory.
    pub fn backend_path(&self) -> &str {
        &self.shared.backend_path
    }

    /// Current backend state.
    pub fn backend_state(&self) -> XenbusState {
        lock(&self.shared.state).backend_state
    }

    /// Last frontend state acted upon.
    pub fn frontend_state(&self) -> XenbusState {
        lock(&self.shared.state).frontend_state
    }

    /// Number of channels owned.
    pub fn channel_count(&self) -> usize {
        lock(&self.shared.state).channels.len()
    }

    /// Returns `true` once the connection is closing or closed, or one of its channels died.
    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated()
    }

    /// Stops watching, closes the connection and stops its async context. Idempotent.
    pub fn close(&self) {
        {
            let mut state = lock(&self.shared.state);
            if state.torn_down {
                return;
            }
            state.torn_down = true;
        }

        debug!("{} close", self.shared.log_id);

        for path in [
            self.shared.frontend_state_path(),
            self.shared.backend_state_path(),
        ] {
            if let Err(err) = self.shared.xen.store.clear_watch(&path) {
                debug!("{} {err}", self.shared.log_id);
            }
        }

        {
            let mut state = lock(&self.shared.state);
            if state.backend_state != XenbusState::Closed {
                self.shared.close_channels(&mut state);
            }
        }

        // Pending error tasks see the torn down flag and return.
        self.shared.async_ctx.stop();
    }
}

impl Drop for FrontendConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{
        mock_xen_interface, test_request, wait_until, FrontendDevice, HookCounters, MockXen,
        TestFrontend,
    };

    const DEVICE: &str = "vtest";
    const BE_DOM: DomId = 0;
    const FE_DOM: DomId = 5;
    const DEV_ID: DevId = 12;
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn expected_action(backend: XenbusState, frontend: XenbusState) -> Action {
        use XenbusState::*;

        let initialising_or_closed = [Initialising, Closed];
        let initialising_or_init_wait = [Initialising, InitWait];
        let initialised_or_connected = [Initialised, Connected];
        let closing_or_closed = [Closing, Closed];

        if frontend == Initialising && initialising_or_closed.contains(&backend) {
            Action::InitWait
        } else if frontend == Initialising && backend == Connected {
            Action::Restart
        } else if initialised_or_connected.contains(&frontend)
            && initialising_or_init_wait.contains(&backend)
        {
            Action::Bind
        } else if closing_or_closed.contains(&frontend)
            && initialised_or_connected.contains(&backend)
        {
            Action::Close
        } else {
            Action::None
        }
    }

    #[test]
    fn test_next_action_all_pairs() {
        let mut actions = 0;

        for backend in XenbusState::ALL {
            for frontend in XenbusState::ALL {
                let action = next_action(backend, frontend);
                assert_eq!(
                    action,
                    expected_action(backend, frontend),
                    "backend: {backend}, frontend: {frontend}"
                );
                if action != Action::None {
                    actions += 1;
                }
            }
        }

        // 2 InitWait + 1 Restart + 4 Bind + 4 Close.
        assert_eq!(actions, 11);
    }

    struct Fixture {
        mock: MockXen,
        device: FrontendDevice,
        counters: Arc<HookCounters>,
        connection: FrontendConnection,
    }

    fn setup() -> Fixture {
        let mock = mock_xen_interface();
        let device = FrontendDevice::new(&mock, DEVICE, BE_DOM, FE_DOM, DEV_ID);
        let counters = Arc::new(HookCounters::default());
        let connection = FrontendConnection::new(
            DEVICE,
            mock.xen.clone(),
            BE_DOM,
            FE_DOM,
            DEV_ID,
            Box::new(TestFrontend::new(counters.clone())),
        )
        .unwrap();

        Fixture {
            mock,
            device,
            counters,
            connection,
        }
    }

    fn wait_backend_state(fixture: &Fixture, state: XenbusState) -> bool {
        wait_until(TIMEOUT, || {
            fixture.connection.backend_state() == state
                && fixture.device.backend_state() == Some(state)
        })
    }

    fn connect(fixture: &Fixture) {
        fixture.device.set_state(XenbusState::Initialising);
        assert!(wait_backend_state(fixture, XenbusState::InitWait));
        fixture.device.set_state(XenbusState::Initialised);
        assert!(wait_backend_state(fixture, XenbusState::Connected));
    }

    /// Brings a fresh connection to `backend`, one of the states a frontend can lead it to.
    fn drive_to(fixture: &Fixture, backend: XenbusState) {
        match backend {
            XenbusState::Initialising => (),
            XenbusState::InitWait => {
                fixture.device.set_state(XenbusState::Initialising);
                assert!(wait_backend_state(fixture, XenbusState::InitWait));
            }
            XenbusState::Connected => connect(fixture),
            XenbusState::Closed => {
                connect(fixture);
                fixture.device.set_state(XenbusState::Closing);
                assert!(wait_backend_state(fixture, XenbusState::Closed));
            }
            _ => unreachable!("{backend} is not reached from the frontend"),
        }
    }

    #[test]
    fn test_frontend_state_effects() {
        use XenbusState::*;

        for backend in [Initialising, InitWait, Connected, Closed] {
            for frontend in XenbusState::ALL {
                let fixture = setup();
                drive_to(&fixture, backend);

                let binds = fixture.counters.binds.load(Ordering::SeqCst);
                let closings = fixture.counters.closings.load(Ordering::SeqCst);

                fixture.device.set_state(frontend);
                fixture.mock.store.flush_watches();

                let (state, new_binds, new_closings) = match expected_action(backend, frontend) {
                    Action::None => (backend, 0, 0),
                    Action::InitWait => (InitWait, 0, 0),
                    Action::Restart => (InitWait, 0, 1),
                    Action::Bind => (Connected, 1, 0),
                    Action::Close => (Closed, 0, 1),
                };

                let case = format!("backend: {backend}, frontend: {frontend}");
                assert_eq!(fixture.connection.backend_state(), state, "{case}");
                assert_eq!(fixture.device.backend_state(), Some(state), "{case}");
                assert_eq!(
                    fixture.counters.binds.load(Ordering::SeqCst) - binds,
                    new_binds,
                    "{case}"
                );
                assert_eq!(
                    fixture.counters.closings.load(Ordering::SeqCst) - closings,
                    new_closings,
                    "{case}"
                );
                assert_eq!(
                    fixture.connection.channel_count(),
                    usize::from(state == Connected),
                    "{case}"
                );
            }
        }
    }

    #[test]
    fn test_paths() {
        let fixture = setup();

        assert_eq!(
            fixture.connection.frontend_path(),
            "/local/domain/5/device/vtest/12"
        );
        assert_eq!(
            fixture.connection.backend_path(),
            "/local/domain/0/backend/vtest/5/12"
        );
        assert_eq!(fixture.connection.dom_id(), FE_DOM);
        assert_eq!(fixture.connection.dev_id(), DEV_ID);
        assert_eq!(
            fixture.device.backend_state(),
            Some(XenbusState::Initialising)
        );
        assert!(fixture
            .mock
            .store
            .has_watch("/local/domain/5/device/vtest/12/state"));
        assert!(fixture
            .mock
            .store
            .has_watch("/local/domain/0/backend/vtest/5/12/state"));
    }

    #[test]
    fn test_handshake() {
        let mut fixture = setup();

        connect(&fixture);
        assert_eq!(fixture.counters.binds.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.connection.channel_count(), 1);
        assert_eq!(fixture.connection.frontend_state(), XenbusState::Initialised);
        assert!(!fixture.connection.is_terminated());

        // The channel serves requests.
        let port = fixture.device.local_port(&fixture.mock).unwrap();
        fixture.device.ring.push_request(&test_request(1, 0));
        fixture.mock.evtchn.signal(port);
        assert!(wait_until(TIMEOUT, || !fixture
            .device
            .ring
            .take_responses()
            .is_empty()));

        // Repeated state reports are ignored.
        fixture.device.set_state(XenbusState::Initialised);
        fixture.mock.store.flush_watches();
        assert_eq!(fixture.counters.binds.load(Ordering::SeqCst), 1);

        fixture.device.set_state(XenbusState::Closing);
        assert!(wait_backend_state(&fixture, XenbusState::Closed));
        assert_eq!(fixture.counters.closings.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.connection.channel_count(), 0);
        assert!(fixture.connection.is_terminated());
        assert_eq!(fixture.mock.evtchn.bound_count(), 0);
        assert_eq!(fixture.mock.gnttab.mapped_count(), 0);

        assert_eq!(
            fixture.device.backend_state_history(),
            vec![
                XenbusState::Initialising,
                XenbusState::InitWait,
                XenbusState::Connected,
                XenbusState::Closing,
                XenbusState::Closed
            ]
        );
    }

    #[test]
    fn test_frontend_connected_binds() {
        let fixture = setup();

        fixture.device.set_state(XenbusState::Initialising);
        assert!(wait_backend_state(&fixture, XenbusState::InitWait));
        fixture.device.set_state(XenbusState::Connected);
        assert!(wait_backend_state(&fixture, XenbusState::Connected));
        assert_eq!(fixture.counters.binds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restart() {
        let fixture = setup();
        connect(&fixture);

        fixture.device.set_state(XenbusState::Initialising);
        assert!(wait_backend_state(&fixture, XenbusState::InitWait));

        assert_eq!(fixture.counters.closings.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.connection.channel_count(), 0);
        assert!(!fixture.connection.is_terminated());

        let history = fixture.device.backend_state_history();
        assert_eq!(
            history[history.len() - 3..],
            [
                XenbusState::Closing,
                XenbusState::Closed,
                XenbusState::InitWait
            ]
        );

        // And connects again.
        fixture.device.set_state(XenbusState::Initialised);
        assert!(wait_backend_state(&fixture, XenbusState::Connected));
        assert_eq!(fixture.counters.binds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_bind_failure_closes() {
        let fixture = setup();
        // No ring page granted for this reference.
        fixture
            .mock
            .store
            .write_string(&format!("{}/ring-ref", fixture.device.path), "999")
            .unwrap();

        fixture.device.set_state(XenbusState::Initialising);
        assert!(wait_backend_state(&fixture, XenbusState::InitWait));
        fixture.device.set_state(XenbusState::Initialised);

        assert!(wait_backend_state(&fixture, XenbusState::Closed));
        assert_eq!(fixture.counters.binds.load(Ordering::SeqCst), 1);
        assert!(fixture.connection.is_terminated());
    }

    #[test]
    fn test_channel_error_closes() {
        let fixture = setup();
        connect(&fixture);

        let port = fixture.device.local_port(&fixture.mock).unwrap();
        fixture.device.ring.set_req_prod(1000);
        fixture.mock.evtchn.signal(port);

        assert!(wait_backend_state(&fixture, XenbusState::Closed));
        assert!(fixture.connection.is_terminated());
        assert_eq!(fixture.connection.channel_count(), 0);
        assert_eq!(fixture.mock.evtchn.bound_count(), 0);
    }

    #[test]
    fn test_backend_state_written_externally() {
        let fixture = setup();
        connect(&fixture);

        fixture
            .mock
            .store
            .write_string(&fixture.device.backend_state_path(), "5")
            .unwrap();

        assert!(wait_until(TIMEOUT, || fixture.connection.backend_state()
            == XenbusState::Closed));
        assert_eq!(fixture.counters.closings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_and_unreadable_states() {
        let fixture = setup();

        fixture
            .mock
            .store
            .write_string(&fixture.device.state_path(), "42")
            .unwrap();
        fixture.mock.store.flush_watches();
        assert_eq!(fixture.connection.backend_state(), XenbusState::Initialising);
        assert_eq!(fixture.connection.frontend_state(), XenbusState::Unknown);

        fixture.mock.store.fail_reads(&fixture.device.state_path(), true);
        fixture.device.set_state(XenbusState::Initialising);
        fixture.mock.store.flush_watches();
        assert_eq!(fixture.connection.backend_state(), XenbusState::Initialising);

        // The next notification is acted upon.
        fixture.mock.store.fail_reads(&fixture.device.state_path(), false);
        fixture.device.set_state(XenbusState::Initialising);
        assert!(wait_backend_state(&fixture, XenbusState::InitWait));
    }

    #[test]
    fn test_close() {
        let fixture = setup();
        connect(&fixture);

        fixture.connection.close();
        fixture.connection.close();

        assert_eq!(fixture.connection.backend_state(), XenbusState::Closed);
        assert_eq!(fixture.counters.closings.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.mock.store.watch_count(), 0);
        assert_eq!(fixture.mock.evtchn.bound_count(), 0);

        // Late notifications are ignored.
        fixture.device.set_state(XenbusState::Initialising);
        fixture.mock.store.flush_watches();
        assert_eq!(fixture.connection.backend_state(), XenbusState::Closed);
    }

    #[test]
    fn test_drop_releases_everything() {
        let fixture = setup();
        connect(&fixture);

        let Fixture {
            mock, connection, ..
        } = fixture;
        drop(connection);

        assert_eq!(mock.store.watch_count(), 0);
        assert_eq!(mock.evtchn.bound_count(), 0);
        assert_eq!(mock.gnttab.mapped_count(), 0);
    }
}
