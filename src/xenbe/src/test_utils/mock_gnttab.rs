// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use utils::lock;
use vm_memory::{MmapRegion, VolatileSlice};

use crate::xen::{DomId, GrantError, GrantMapper, GrantRef, XEN_PAGE_SIZE};

/// A page granted by a mock frontend.
pub struct MockPage {
    region: MmapRegion,
}

impl fmt::Debug for MockPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPage")
            .field("addr", &self.region.as_ptr())
            .finish()
    }
}

impl MockPage {
    fn new() -> Self {
        MockPage {
            region: MmapRegion::<()>::new(XEN_PAGE_SIZE).unwrap(),
        }
    }

    /// Frontend view of the page.
    pub fn as_volatile_slice(&self) -> VolatileSlice<'_> {
        // SAFETY: the region is a live anonymous mapping of `size()` bytes owned by `self`.
        unsafe { VolatileSlice::new(self.region.as_ptr(), self.region.size()) }
    }

    fn addr(&self) -> NonNull<u8> {
        // The mapping never starts at 0.
        NonNull::new(self.region.as_ptr()).unwrap()
    }
}

#[derive(Debug, Default)]
struct Grants {
    pages: HashMap<(DomId, GrantRef), Arc<MockPage>>,
    // Map count by page address.
    mapped: HashMap<usize, usize>,
    maps: usize,
    unmaps: usize,
    fail_map: bool,
}

/// Grant table backed by anonymous pages. Every mapping of a reference aliases the same page.
#[derive(Debug, Default)]
pub struct MockGnttab {
    grants: Mutex<Grants>,
}

impl MockGnttab {
    pub fn new() -> Self {
        MockGnttab::default()
    }

    /// Grants a zeroed page as `gref` of `dom_id`, or returns the page already granted.
    pub fn grant(&self, dom_id: DomId, gref: GrantRef) -> Arc<MockPage> {
        lock(&self.grants)
            .pages
            .entry((dom_id, gref))
            .or_insert_with(|| Arc::new(MockPage::new()))
            .clone()
    }

    /// Number of live mappings.
    pub fn mapped_count(&self) -> usize {
        lock(&self.grants).mapped.values().sum()
    }

    pub fn map_count(&self) -> usize {
        lock(&self.grants).maps
    }

    pub fn unmap_count(&self) -> usize {
        lock(&self.grants).unmaps
    }

    pub fn fail_map(&self, fail: bool) {
        lock(&self.grants).fail_map = fail;
    }
}

impl GrantMapper for MockGnttab {
    fn map_grant_refs(
        &self,
        dom_id: DomId,
        refs: &[GrantRef],
        _writable: bool,
    ) -> Result<NonNull<u8>, GrantError> {
        let mut grants = lock(&self.grants);
        let map_error = |kind| GrantError::Map(dom_id, refs.to_vec(), io::Error::from(kind));

        if grants.fail_map {
            return Err(map_error(io::ErrorKind::PermissionDenied));
        }

        let [gref] = refs else {
            return Err(map_error(io::ErrorKind::Unsupported));
        };

        let addr = grants
            .pages
            .get(&(dom_id, *gref))
            .map(|page| page.addr())
            .ok_or_else(|| map_error(io::ErrorKind::NotFound))?;

        *grants.mapped.entry(addr.as_ptr() as usize).or_default() += 1;
        grants.maps += 1;

        Ok(addr)
    }

    fn unmap(&self, addr: NonNull<u8>, _count: usize) -> Result<(), GrantError> {
        let mut grants = lock(&self.grants);
        let key = addr.as_ptr() as usize;

        match grants.mapped.get_mut(&key) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    grants.mapped.remove(&key);
                }
                grants.unmaps += 1;
                Ok(())
            }
            None => Err(GrantError::Unmap(
                key,
                io::Error::from(io::ErrorKind::NotFound),
            )),
        }
    }
}
