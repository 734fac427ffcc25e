// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow table introspection

use std::fmt::Display;

use crate::FlowTable;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowStats {
    pub entries: usize,
    pub short: usize,
    /// Entries that currently have a reverse.
    pub linked: usize,
    pub evicted: usize,
    pub linklocal_ports: usize,
    /// Flows refused by the flow limit since start.
    pub refused: u64,
}

impl FlowTable {
    #[must_use]
    pub fn stats(&self) -> FlowStats {
        let mut stats = FlowStats {
            refused: self.limits.refused(),
            ..Default::default()
        };
        for entry in self.entries() {
            stats.entries += 1;
            stats.short += usize::from(entry.is_short());
            stats.linked += usize::from(entry.reverse.is_some());
            stats.evicted += usize::from(entry.is_evicted());
            stats.linklocal_ports += usize::from(entry.owns_linklocal_port());
        }
        stats
    }

    /// Entries of a VRF, one per line.
    #[must_use]
    pub fn dump_vrf(&self, vrf: u32) -> String {
        let mut out = String::new();
        for entry in self.list_by_vrf(vrf) {
            out += &format!("{entry}\n");
        }
        out
    }
}

impl Display for FlowStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Flows")?;
        writeln!(f, "  entries         : {}", self.entries)?;
        writeln!(f, "  short           : {}", self.short)?;
        writeln!(f, "  linked          : {}", self.linked)?;
        writeln!(f, "  evicted         : {}", self.evicted)?;
        writeln!(f, "  link-local ports: {}", self.linklocal_ports)?;
        writeln!(f, "  refused         : {}", self.refused)
    }
}
