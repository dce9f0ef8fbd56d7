// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use log::{debug, error};

use super::{DomId, EvtchnPort};

/// Errors associated with event channels.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum EvtchnError {
    /// Can't open event channel: {0}
    Open(io::Error),
    /// Can't bind event channel, dom: {0}, remote port: {1}: {2}
    Bind(DomId, EvtchnPort, io::Error),
    /// Can't unbind event channel, port: {0}: {1}
    Unbind(EvtchnPort, io::Error),
    /// Can't notify event channel, port: {0}: {1}
    Notify(EvtchnPort, io::Error),
    /// Can't get pending port: {0}
    Pending(io::Error),
    /// Can't unmask event channel, port: {0}: {1}
    Unmask(EvtchnPort, io::Error),
    /// Error port number: {0}, expected: {1}
    PortMismatch(EvtchnPort, EvtchnPort),
}

impl EvtchnError {
    /// Returns `true` for transient failures of an otherwise healthy channel.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EvtchnError::Notify(_, err) => matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// An open event channel device handle (`xenevtchn_handle`).
pub trait EventChannelHandle: Send + Sync {
    /// Binds a local port to `remote_port` of domain `dom_id` and returns the local port.
    fn bind_interdomain(
        &self,
        dom_id: DomId,
        remote_port: EvtchnPort,
    ) -> Result<EvtchnPort, EvtchnError>;

    /// Releases a local port.
    fn unbind(&self, port: EvtchnPort) -> Result<(), EvtchnError>;

    /// Signals the remote end of `port`.
    fn notify(&self, port: EvtchnPort) -> Result<(), EvtchnError>;

    /// Dequeues the next port with a pending event. The port stays masked until unmasked.
    fn pending(&self) -> Result<EvtchnPort, EvtchnError>;

    /// Re-arms `port` after its event was dequeued.
    fn unmask(&self, port: EvtchnPort) -> Result<(), EvtchnError>;

    /// Descriptor that becomes readable while events are pending.
    fn fd(&self) -> RawFd;
}

/// Opens event channel handles.
pub trait EventChannelFactory: Send + Sync {
    /// Opens a fresh handle.
    fn open(&self) -> Result<Box<dyn EventChannelHandle>, EvtchnError>;
}

/// An interdomain event channel bound for the lifetime of this object.
pub struct XenEvtchn {
    dom_id: DomId,
    remote_port: EvtchnPort,
    local_port: EvtchnPort,
    handle: Box<dyn EventChannelHandle>,
}

impl fmt::Debug for XenEvtchn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XenEvtchn")
            .field("dom_id", &self.dom_id)
            .field("remote_port", &self.remote_port)
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

impl XenEvtchn {
    /// Opens a handle and binds it to `remote_port` of domain `dom_id`.
    pub fn new(
        factory: &dyn EventChannelFactory,
        dom_id: DomId,
        remote_port: EvtchnPort,
    ) -> Result<Self, EvtchnError> {
        let handle = factory.open()?;
        let local_port = handle.bind_interdomain(dom_id, remote_port)?;

        debug!(
            "Create event channel, dom: {dom_id}, remote port: {remote_port}, local port: \
             {local_port}"
        );

        Ok(XenEvtchn {
            dom_id,
            remote_port,
            local_port,
            handle,
        })
    }

    /// Peer domain.
    pub fn dom_id(&self) -> DomId {
        self.dom_id
    }

    /// Port allocated by the peer.
    pub fn remote_port(&self) -> EvtchnPort {
        self.remote_port
    }

    /// Port returned by the bind.
    pub fn local_port(&self) -> EvtchnPort {
        self.local_port
    }

    /// Readiness source for the bound port.
    pub fn fd(&self) -> RawFd {
        self.handle.fd()
    }

    /// Rings the peer's doorbell.
    pub fn notify(&self) -> Result<(), EvtchnError> {
        self.handle.notify(self.local_port)
    }

    /// Consumes the pending event, checking it was raised on this channel, and re-arms it.
    pub fn ack_pending(&self) -> Result<(), EvtchnError> {
        let port = self.handle.pending()?;

        if port != self.local_port {
            return Err(EvtchnError::PortMismatch(port, self.local_port));
        }

        self.handle.unmask(port)
    }
}

impl Drop for XenEvtchn {
    fn drop(&mut self) {
        if let Err(err) = self.handle.unbind(self.local_port) {
            error!("{err}");
        }

        debug!("Delete event channel, port: {}", self.local_port);
    }
}
