// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging for xenbe based backends.
//!
//! The crate logs through the `log` facade. [`Logger`] is the `log::Log` implementation a
//! backend binary installs: it prefixes every line with the local time, the name of the thread
//! that logged it and, optionally, the level and source location.

mod logging;

pub use log::{debug, error, info, trace, warn};

pub use self::logging::{
    LevelFilter, LevelFilterFromStrError, Logger, LoggerConfig, LoggerInitError,
    LoggerUpdateError, DEFAULT_LEVEL, LOG_PREFIX,
};
