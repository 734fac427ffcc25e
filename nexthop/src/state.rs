// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Process-wide forwarding state: the nexthop store and the resource manager, mutated together
//! under one lock.

use config::AgentConfig;
use parking_lot::Mutex;
use resource::{ResourceKind, ResourceManager};
use std::sync::Arc;
use tracing::debug;

use crate::{NextHopError, NextHopStore};

pub struct ForwardingState {
    pub nexthops: NextHopStore,
    pub resources: ResourceManager,
}

pub type SharedForwardingState = Arc<Mutex<ForwardingState>>;

/// What one [`ForwardingState::gc`] pass reclaimed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    pub nexthops: usize,
    pub labels: usize,
    pub ports: usize,
}

impl GcReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nexthops == 0 && self.labels == 0 && self.ports == 0
    }
}

impl ForwardingState {
    pub fn new(config: &AgentConfig) -> Result<Self, NextHopError> {
        let mut resources = ResourceManager::new(&config.mpls, &config.linklocal)?;
        let nexthops = NextHopStore::new(&config.nexthop, &mut resources);
        Ok(Self {
            nexthops,
            resources,
        })
    }

    pub fn shared(config: &AgentConfig) -> Result<SharedForwardingState, NextHopError> {
        Ok(Arc::new(Mutex::new(Self::new(config)?)))
    }

    /// Finalize pending nexthop deletions, then the resource releases they unblocked.
    pub fn gc(&mut self) -> GcReport {
        let nexthops = self.nexthops.gc(&mut self.resources).len();
        let freed = self.resources.gc();
        let report = GcReport {
            nexthops,
            labels: freed
                .iter()
                .filter(|(k, _)| *k == ResourceKind::MplsLabel)
                .count(),
            ports: freed
                .iter()
                .filter(|(k, _)| *k == ResourceKind::LinkLocalPort)
                .count(),
        };
        if !report.is_empty() {
            debug!("gc: {report:?}");
        }
        report
    }
}
