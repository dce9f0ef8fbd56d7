// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::Arc;

use super::DomId;

/// Callback fired with the watched path when it or one of its descendants changes.
pub type WatchCallback = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Errors associated with [`XenStore`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum XenStoreError {
    /// Can't open xs daemon: {0}
    Open(io::Error),
    /// Can't get domain path for domain {0}
    DomainPath(DomId),
    /// Can't read from {0}
    Read(String),
    /// Can't write value to {0}
    Write(String),
    /// Can't remove path {0}
    Remove(String),
    /// Invalid integer at {path}: {value:?}
    InvalidInt {
        /// Path that was read.
        path: String,
        /// Raw value found there.
        value: String,
    },
    /// Can't set xs watch for {0}
    SetWatch(String),
    /// Can't clear xs watch for {0}
    ClearWatch(String),
}

/// Hierarchical key/value configuration store shared by all domains (xenstore).
pub trait XenStore: Send + Sync {
    /// Returns the root path of domain `dom_id`, e.g. `/local/domain/5`.
    fn domain_path(&self, dom_id: DomId) -> Result<String, XenStoreError>;

    /// Reads the value at `path`.
    fn read_string(&self, path: &str) -> Result<String, XenStoreError>;

    /// Writes `value` at `path`, creating missing parents.
    fn write_string(&self, path: &str, value: &str) -> Result<(), XenStoreError>;

    /// Lists the names of the children of `path`. A missing path has no children.
    fn read_directory(&self, path: &str) -> Result<Vec<String>, XenStoreError>;

    /// Returns `true` if `path` exists.
    fn exists(&self, path: &str) -> bool;

    /// Removes `path` and its subtree.
    fn remove(&self, path: &str) -> Result<(), XenStoreError>;

    /// Installs `callback` for changes at or below `path`, replacing a previous watch on the
    /// same path. The callback runs on the store's dispatch thread and fires once right after
    /// registration.
    fn set_watch(&self, path: &str, callback: WatchCallback) -> Result<(), XenStoreError>;

    /// Removes the watch on `path`.
    fn clear_watch(&self, path: &str) -> Result<(), XenStoreError>;

    /// Reads a signed decimal integer.
    fn read_int(&self, path: &str) -> Result<i64, XenStoreError> {
        let value = self.read_string(path)?;
        value
            .trim()
            .parse()
            .map_err(|_| XenStoreError::InvalidInt {
                path: path.to_string(),
                value,
            })
    }

    /// Reads an unsigned decimal integer, such as a port number or a grant reference.
    fn read_uint(&self, path: &str) -> Result<u32, XenStoreError> {
        let value = self.read_string(path)?;
        value
            .trim()
            .parse()
            .map_err(|_| XenStoreError::InvalidInt {
                path: path.to_string(),
                value,
            })
    }

    /// Writes a decimal integer.
    fn write_int(&self, path: &str, value: i64) -> Result<(), XenStoreError> {
        self.write_string(path, &value.to_string())
    }
}
