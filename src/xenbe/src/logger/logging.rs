// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use std::thread;

use log::{Log, Metadata, Record};
use serde::{Deserialize, Deserializer, Serialize};
use utils::lock;
use utils::time::LocalTime;

/// Level used when the configuration doesn't set one.
pub const DEFAULT_LEVEL: log::LevelFilter = log::LevelFilter::Info;
/// Tag identifying the backend core in log lines.
pub const LOG_PREFIX: &str = "xenbe";

/// Error type for [`Logger::init`].
pub type LoggerInitError = log::SetLoggerError;

/// Error type for [`Logger::new`].
#[derive(Debug, thiserror::Error)]
#[error("Failed to open target file: {0}")]
pub struct LoggerUpdateError(pub std::io::Error);

#[derive(Debug)]
struct LogFormat {
    show_level: bool,
    show_log_origin: bool,
}

#[derive(Debug)]
struct LoggerState {
    target: Option<File>,
    module: Option<String>,
    format: LogFormat,
}

/// Writes log records to a file, or to stdout when no file is configured.
#[derive(Debug)]
pub struct Logger {
    level: log::LevelFilter,
    state: Mutex<LoggerState>,
}

impl Logger {
    /// Creates a logger from `config`, opening its target file if any.
    pub fn new(config: &LoggerConfig) -> Result<Self, LoggerUpdateError> {
        let target = match &config.log_path {
            Some(log_path) => Some(
                std::fs::OpenOptions::new()
                    .custom_flags(libc::O_NONBLOCK)
                    .create(true)
                    .append(true)
                    .open(log_path)
                    .map_err(LoggerUpdateError)?,
            ),
            None => None,
        };

        Ok(Logger {
            level: config
                .level
                .map(log::LevelFilter::from)
                .unwrap_or(DEFAULT_LEVEL),
            state: Mutex::new(LoggerState {
                target,
                module: config.module.clone(),
                format: LogFormat {
                    show_level: config.show_level.unwrap_or(false),
                    show_log_origin: config.show_log_origin.unwrap_or(false),
                },
            }),
        })
    }

    /// Level filter applied through [`log::set_max_level`].
    pub fn level(&self) -> log::LevelFilter {
        self.level
    }

    /// Installs the logger as the process wide `log` implementation.
    pub fn init(self) -> Result<(), LoggerInitError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    fn format(&self, state: &LoggerState, record: &Record) -> String {
        let thread = thread::current().name().unwrap_or("-").to_string();
        let level = match state.format.show_level {
            true => format!(":{}", record.level()),
            false => String::new(),
        };

        let origin = match state.format.show_log_origin {
            true => {
                let file = record.file().unwrap_or("?");
                let line = match record.line() {
                    Some(x) => x.to_string(),
                    None => String::from("?"),
                };
                format!(":{file}:{line}")
            }
            false => String::new(),
        };

        format!(
            "{} [{LOG_PREFIX}:{thread}{level}{origin}] {}\n",
            LocalTime::now(),
            record.args()
        )
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut state = lock(&self.state);

        let enabled_module = match (&state.module, record.module_path()) {
            (Some(filter), Some(source)) => source.starts_with(filter),
            (Some(_), None) => false,
            (None, _) => true,
        };
        if !enabled_module {
            return;
        }

        let message = self.format(&state, record);

        // Nowhere to report a failed write.
        let _ = match &mut state.target {
            Some(file) => file.write_all(message.as_bytes()),
            None => std::io::stdout().write_all(message.as_bytes()),
        };
    }

    fn flush(&self) {
        let mut state = lock(&self.state);
        let _ = match &mut state.target {
            Some(file) => file.flush(),
            None => std::io::stdout().flush(),
        };
    }
}

/// Strongly typed structure used to describe the logger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    /// Named pipe or file used as output for logs.
    pub log_path: Option<PathBuf>,
    /// The level of the Logger.
    pub level: Option<LevelFilter>,
    /// Whether to show the log level in the log.
    pub show_level: Option<bool>,
    /// Whether to show the log origin in the log.
    pub show_log_origin: Option<bool>,
    /// The module to filter logs by.
    pub module: Option<String>,
}

/// Log level accepted in configuration files, case insensitive. `warning` is an alias of `warn`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LevelFilter {
    /// [`log::LevelFilter::Off`]
    Off,
    /// [`log::LevelFilter::Trace`]
    Trace,
    /// [`log::LevelFilter::Debug`]
    Debug,
    /// [`log::LevelFilter::Info`]
    Info,
    /// [`log::LevelFilter::Warn`]
    Warn,
    /// [`log::LevelFilter::Error`]
    Error,
}

impl From<LevelFilter> for log::LevelFilter {
    fn from(filter: LevelFilter) -> log::LevelFilter {
        match filter {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Trace => log::LevelFilter::Trace,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Error => log::LevelFilter::Error,
        }
    }
}

impl<'de> Deserialize<'de> for LevelFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let key = String::deserialize(deserializer)?;
        LevelFilter::from_str(&key).map_err(D::Error::custom)
    }
}

/// Error type for [`<LevelFilter as FromStr>::from_str`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("Failed to parse string to level filter: {0}")]
pub struct LevelFilterFromStrError(String);

impl FromStr for LevelFilter {
    type Err = LevelFilterFromStrError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(LevelFilterFromStrError(String::from(s))),
        }
    }
}
