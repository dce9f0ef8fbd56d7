// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend configuration, loaded from JSON.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logger::{Logger, LoggerConfig, LoggerInitError, LoggerUpdateError};
use crate::xen::DomId;

/// Interval between two frontend discovery passes.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Errors associated with [`BackendConfig`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ConfigError {
    /// Cannot read config file {0:?}: {1}
    Read(PathBuf, io::Error),
    /// Cannot parse config: {0}
    Parse(#[from] serde_json::Error),
    /// Device name is empty
    EmptyDeviceName,
    /// Device name {0:?} must not contain '/'
    InvalidDeviceName(String),
    /// Poll interval must be greater than 0
    ZeroPollInterval,
    /// Cannot create logger: {0}
    Logger(#[from] LoggerUpdateError),
    /// Cannot install logger: {0}
    LoggerInit(#[from] LoggerInitError),
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// Configuration of a [`Backend`](crate::backend::Backend).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Device class served, e.g. `vif` or `vkbd`. It names the `device/<class>` and
    /// `backend/<class>` store directories.
    pub device_name: String,
    /// Domain the backend runs in. Read from the store key `domid` when unset.
    #[serde(default)]
    pub dom_id: Option<DomId>,
    /// Interval between two frontend discovery passes, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Logger to install, if any.
    #[serde(default)]
    pub logger: Option<LoggerConfig>,
}

impl BackendConfig {
    /// Configuration with defaults for device class `device_name`.
    pub fn new(device_name: &str) -> Self {
        BackendConfig {
            device_name: device_name.to_string(),
            dom_id: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            logger: None,
        }
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: BackendConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json =
            std::fs::read_to_string(path).map_err(|err| ConfigError::Read(path.into(), err))?;
        Self::from_json(&json)
    }

    /// Checks the values can be used to build a backend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::EmptyDeviceName);
        }
        if self.device_name.contains('/') {
            return Err(ConfigError::InvalidDeviceName(self.device_name.clone()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }

    /// Builds the configured logger and installs it as the process wide `log` implementation.
    /// Does nothing without a logger section. Fails if a logger is already installed.
    pub fn init_logger(&self) -> Result<(), ConfigError> {
        if let Some(config) = &self.logger {
            Logger::new(config)?.init()?;
        }
        Ok(())
    }

    /// [`BackendConfig::poll_interval_ms`] as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
