// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime core of Xen paravirtualized device backends.
//!
//! A backend process serves one device class (`vif`, `vkbd`, ...) for every foreign domain.
//! [`backend::Backend`] discovers the frontend devices published in xenstore,
//! [`frontend::FrontendConnection`] runs the xenbus handshake with each of them and the
//! [`ring`] channels move requests, responses and events through the pages the frontend
//! granted. The Xen primitives are reached through the traits in [`xen`], so the whole core
//! runs against the in-memory implementations of [`test_utils`].
#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod backend;
pub mod config;
pub mod frontend;
pub mod logger;
pub mod ring;
pub mod test_utils;
pub mod xen;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
