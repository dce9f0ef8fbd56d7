// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use utils::eventfd::{EventFd, EFD_NONBLOCK};
use utils::lock;

use crate::xen::{DomId, EventChannelFactory, EventChannelHandle, EvtchnError, EvtchnPort};

/// Pending queue of one handle. Its eventfd is readable while the queue isn't empty.
#[derive(Debug)]
struct HandleEvents {
    event_fd: EventFd,
    pending: Mutex<VecDeque<EvtchnPort>>,
}

impl HandleEvents {
    fn raise(&self, port: EvtchnPort) {
        let mut pending = lock(&self.pending);
        pending.push_back(port);
        self.event_fd.write(1).unwrap();
    }

    fn pop(&self) -> Option<EvtchnPort> {
        let mut pending = lock(&self.pending);
        let port = pending.pop_front();

        if pending.is_empty() {
            match self.event_fd.read() {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => panic!("Can't reset mock event fd: {err}"),
            }
        }

        port
    }
}

#[derive(Debug)]
struct BoundPort {
    dom_id: DomId,
    remote_port: EvtchnPort,
    events: Arc<HandleEvents>,
    notifications: usize,
}

#[derive(Debug, Default)]
struct Ports {
    last_port: EvtchnPort,
    bound: HashMap<EvtchnPort, BoundPort>,
    notify_error: Option<io::ErrorKind>,
    fail_bind: bool,
    unmasks: usize,
}

/// Event channel driver simulating the frontend end of every bound port.
#[derive(Debug, Default)]
pub struct MockEvtchn {
    ports: Arc<Mutex<Ports>>,
}

impl MockEvtchn {
    pub fn new() -> Self {
        MockEvtchn::default()
    }

    /// Raises an event on local port `port`, as a frontend notification would.
    pub fn signal(&self, port: EvtchnPort) {
        self.inject_pending(port, port);
    }

    /// Makes the handle bound to `port` report `reported` as its pending port.
    pub fn inject_pending(&self, port: EvtchnPort, reported: EvtchnPort) {
        let ports = lock(&self.ports);
        if let Some(bound) = ports.bound.get(&port) {
            bound.events.raise(reported);
        }
    }

    /// Number of notifications the backend sent on `port`.
    pub fn notify_count(&self, port: EvtchnPort) -> usize {
        lock(&self.ports)
            .bound
            .get(&port)
            .map_or(0, |bound| bound.notifications)
    }

    /// Local port bound to `remote_port` of `dom_id`, if any.
    pub fn local_port(&self, dom_id: DomId, remote_port: EvtchnPort) -> Option<EvtchnPort> {
        lock(&self.ports)
            .bound
            .iter()
            .find(|(_, bound)| bound.dom_id == dom_id && bound.remote_port == remote_port)
            .map(|(port, _)| *port)
    }

    pub fn bound_count(&self) -> usize {
        lock(&self.ports).bound.len()
    }

    pub fn unmask_count(&self) -> usize {
        lock(&self.ports).unmasks
    }

    /// Makes notifications fail with `kind` until reset with `None`.
    pub fn fail_notify(&self, kind: Option<io::ErrorKind>) {
        lock(&self.ports).notify_error = kind;
    }

    pub fn fail_bind(&self, fail: bool) {
        lock(&self.ports).fail_bind = fail;
    }
}

impl EventChannelFactory for MockEvtchn {
    fn open(&self) -> Result<Box<dyn EventChannelHandle>, EvtchnError> {
        let event_fd = EventFd::new(EFD_NONBLOCK).map_err(EvtchnError::Open)?;

        Ok(Box::new(MockEvtchnHandle {
            ports: self.ports.clone(),
            events: Arc::new(HandleEvents {
                event_fd,
                pending: Mutex::new(VecDeque::new()),
            }),
        }))
    }
}

struct MockEvtchnHandle {
    ports: Arc<Mutex<Ports>>,
    events: Arc<HandleEvents>,
}

impl fmt::Debug for MockEvtchnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockEvtchnHandle")
            .field("fd", &self.events.event_fd.as_raw_fd())
            .finish_non_exhaustive()
    }
}

impl EventChannelHandle for MockEvtchnHandle {
    fn bind_interdomain(
        &self,
        dom_id: DomId,
        remote_port: EvtchnPort,
    ) -> Result<EvtchnPort, EvtchnError> {
        let mut ports = lock(&self.ports);

        if ports.fail_bind {
            return Err(EvtchnError::Bind(
                dom_id,
                remote_port,
                io::Error::from(io::ErrorKind::ConnectionRefused),
            ));
        }

        ports.last_port += 1;
        let port = ports.last_port;

        ports.bound.insert(
            port,
            BoundPort {
                dom_id,
                remote_port,
                events: self.events.clone(),
                notifications: 0,
            },
        );

        Ok(port)
    }

    fn unbind(&self, port: EvtchnPort) -> Result<(), EvtchnError> {
        lock(&self.ports)
            .bound
            .remove(&port)
            .map(|_| ())
            .ok_or_else(|| EvtchnError::Unbind(port, io::Error::from(io::ErrorKind::NotFound)))
    }

    fn notify(&self, port: EvtchnPort) -> Result<(), EvtchnError> {
        let mut ports = lock(&self.ports);

        if let Some(kind) = ports.notify_error {
            return Err(EvtchnError::Notify(port, io::Error::from(kind)));
        }

        let bound = ports
            .bound
            .get_mut(&port)
            .ok_or_else(|| EvtchnError::Notify(port, io::Error::from(io::ErrorKind::NotFound)))?;
        bound.notifications += 1;

        Ok(())
    }

    fn pending(&self) -> Result<EvtchnPort, EvtchnError> {
        self.events
            .pop()
            .ok_or_else(|| EvtchnError::Pending(io::Error::from(io::ErrorKind::WouldBlock)))
    }

    fn unmask(&self, _port: EvtchnPort) -> Result<(), EvtchnError> {
        lock(&self.ports).unmasks += 1;
        Ok(())
    }

    fn fd(&self) -> RawFd {
        self.events.event_fd.as_raw_fd()
    }
}
