// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use log::{debug, error};
use vm_memory::VolatileSlice;

use super::{DomId, GrantRef, XEN_PAGE_SIZE};

/// Errors associated with grant mappings.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum GrantError {
    /// No grant references to map
    NoRefs,
    /// Can't map buffer, dom: {0}, refs: {1:?}: {2}
    Map(DomId, Vec<GrantRef>, io::Error),
    /// Can't unmap buffer at {0:#x}: {1}
    Unmap(usize, io::Error),
}

/// Maps pages granted by other domains into this address space (`xengnttab`).
pub trait GrantMapper: Send + Sync {
    /// Maps `refs` of domain `dom_id` contiguously and returns the base address.
    fn map_grant_refs(
        &self,
        dom_id: DomId,
        refs: &[GrantRef],
        writable: bool,
    ) -> Result<NonNull<u8>, GrantError>;

    /// Unmaps `count` pages previously returned by [`GrantMapper::map_grant_refs`].
    fn unmap(&self, addr: NonNull<u8>, count: usize) -> Result<(), GrantError>;
}

/// Granted pages mapped for the lifetime of this object.
pub struct GrantBuffer {
    mapper: Arc<dyn GrantMapper>,
    dom_id: DomId,
    refs: Vec<GrantRef>,
    addr: NonNull<u8>,
}

// SAFETY: the mapping is plain memory that stays valid until drop and is only accessed through
// volatile operations, so it can be shared with and sent to other threads.
unsafe impl Send for GrantBuffer {}
// SAFETY: see above.
unsafe impl Sync for GrantBuffer {}

impl fmt::Debug for GrantBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantBuffer")
            .field("dom_id", &self.dom_id)
            .field("refs", &self.refs)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl GrantBuffer {
    /// Maps `refs` of domain `dom_id` read/write.
    pub fn new(
        mapper: Arc<dyn GrantMapper>,
        dom_id: DomId,
        refs: &[GrantRef],
    ) -> Result<Self, GrantError> {
        if refs.is_empty() {
            return Err(GrantError::NoRefs);
        }

        let addr = mapper.map_grant_refs(dom_id, refs, true)?;

        debug!(
            "Create grant table buffer, dom: {dom_id}, count: {}, ref: {}",
            refs.len(),
            refs[0]
        );

        Ok(GrantBuffer {
            mapper,
            dom_id,
            refs: refs.to_vec(),
            addr,
        })
    }

    /// Domain that granted the pages.
    pub fn dom_id(&self) -> DomId {
        self.dom_id
    }

    /// First grant reference, the one used to identify the buffer.
    pub fn grant_ref(&self) -> GrantRef {
        self.refs[0]
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.refs.len() * XEN_PAGE_SIZE
    }

    /// Bounds-checked view of the mapping.
    pub fn as_volatile_slice(&self) -> VolatileSlice<'_> {
        // SAFETY: `addr` points to `size()` mapped bytes that stay valid until `self` is dropped,
        // which the returned lifetime enforces.
        unsafe { VolatileSlice::new(self.addr.as_ptr(), self.size()) }
    }
}

impl Drop for GrantBuffer {
    fn drop(&mut self) {
        debug!("Delete grant table buffer, dom: {}", self.dom_id);

        if let Err(err) = self.mapper.unmap(self.addr, self.refs.len()) {
            error!("{err}");
        }
    }
}
