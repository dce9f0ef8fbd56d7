// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::Mutex;

use utils::lock;

use crate::xen::{DomId, DomainEntry, DomainInfo, DomainInfoError};

#[derive(Debug, Default)]
struct Domains {
    entries: Vec<DomainEntry>,
    fail: bool,
}

/// Domain list editable from tests.
#[derive(Debug, Default)]
pub struct MockDomains {
    domains: Mutex<Domains>,
}

impl MockDomains {
    pub fn new(dom_ids: &[DomId]) -> Self {
        let mock = MockDomains::default();
        for dom_id in dom_ids {
            mock.add(*dom_id);
        }
        mock
    }

    /// Adds a running domain.
    pub fn add(&self, dom_id: DomId) {
        let mut domains = lock(&self.domains);
        if !domains.entries.iter().any(|entry| entry.dom_id == dom_id) {
            domains.entries.push(DomainEntry {
                dom_id,
                running: true,
            });
        }
    }

    /// Destroys a domain.
    pub fn remove(&self, dom_id: DomId) {
        lock(&self.domains)
            .entries
            .retain(|entry| entry.dom_id != dom_id);
    }

    pub fn set_running(&self, dom_id: DomId, running: bool) {
        for entry in lock(&self.domains).entries.iter_mut() {
            if entry.dom_id == dom_id {
                entry.running = running;
            }
        }
    }

    /// Makes the queries fail until reset.
    pub fn fail_queries(&self, fail: bool) {
        lock(&self.domains).fail = fail;
    }
}

impl DomainInfo for MockDomains {
    fn domains(&self) -> Result<Vec<DomainEntry>, DomainInfoError> {
        let domains = lock(&self.domains);

        if domains.fail {
            return Err(DomainInfoError::Query(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )));
        }

        Ok(domains.entries.clone())
    }
}
