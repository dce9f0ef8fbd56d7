// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;

use super::DomId;

/// Errors associated with [`DomainInfo`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DomainInfoError {
    /// Can't get domains info: {0}
    Query(io::Error),
}

/// One domain as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainEntry {
    /// Domain id.
    pub dom_id: DomId,
    /// Whether the domain is currently scheduled.
    pub running: bool,
}

/// Domain enumeration.
pub trait DomainInfo: Send + Sync {
    /// Returns every domain known to the hypervisor.
    fn domains(&self) -> Result<Vec<DomainEntry>, DomainInfoError>;

    /// Returns the ids of all existing domains.
    fn existing_domains(&self) -> Result<Vec<DomId>, DomainInfoError> {
        Ok(self.domains()?.iter().map(|entry| entry.dom_id).collect())
    }

    /// Returns the ids of the domains currently running.
    fn running_domains(&self) -> Result<Vec<DomId>, DomainInfoError> {
        Ok(self
            .domains()?
            .iter()
            .filter(|entry| entry.running)
            .map(|entry| entry.dom_id)
            .collect())
    }
}
