// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

/// Handshake state published by both ends under their `state` node (`xen/io/xenbus.h`).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XenbusState {
    /// Not yet known.
    Unknown = 0,
    /// Setting up.
    Initialising = 1,
    /// Finished early initialisation, waiting for information from the peer or hotplug
    /// scripts.
    InitWait = 2,
    /// Waiting for a connection from the peer.
    Initialised = 3,
    /// Connected.
    Connected = 4,
    /// The device is being closed due to an error or an unplug event.
    Closing = 5,
    /// Closed.
    Closed = 6,
    /// The device is being reconfigured.
    Reconfiguring = 7,
    /// Reconfiguration finished.
    Reconfigured = 8,
}

/// A store value that does not encode a [`XenbusState`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("Invalid xenbus state: {0}")]
pub struct InvalidXenbusState(pub String);

impl XenbusState {
    /// All states in protocol order.
    pub const ALL: [XenbusState; 9] = [
        XenbusState::Unknown,
        XenbusState::Initialising,
        XenbusState::InitWait,
        XenbusState::Initialised,
        XenbusState::Connected,
        XenbusState::Closing,
        XenbusState::Closed,
        XenbusState::Reconfiguring,
        XenbusState::Reconfigured,
    ];

    /// Value written to the store.
    pub fn value(self) -> u32 {
        self as u32
    }

    /// Returns `true` for `Closing` and `Closed`.
    pub fn is_closing_or_closed(self) -> bool {
        matches!(self, XenbusState::Closing | XenbusState::Closed)
    }
}

impl TryFrom<u32> for XenbusState {
    type Error = InvalidXenbusState;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
            .ok_or_else(|| InvalidXenbusState(value.to_string()))
    }
}

impl FromStr for XenbusState {
    type Err = InvalidXenbusState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map_err(|_| InvalidXenbusState(s.to_string()))
            .and_then(XenbusState::try_from)
    }
}

impl fmt::Display for XenbusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XenbusState::Unknown => "Unknown",
            XenbusState::Initialising => "Initialising",
            XenbusState::InitWait => "InitWait",
            XenbusState::Initialised => "Initialised",
            XenbusState::Connected => "Connected",
            XenbusState::Closing => "Closing",
            XenbusState::Closed => "Closed",
            XenbusState::Reconfiguring => "Reconfiguring",
            XenbusState::Reconfigured => "Reconfigured",
        };
        write!(f, "[{name}]")
    }
}
