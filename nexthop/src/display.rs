// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Nexthop listing

use std::fmt::Display;

use crate::{NextHop, NextHopStore, NhState};

/// One row of the nexthop listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHopInfo {
    pub id: u32,
    pub key: String,
    pub refcount: u32,
    pub state: NhState,
    /// Occupied member slots, for composites.
    pub members: Option<usize>,
}

impl From<&NextHop> for NextHopInfo {
    fn from(nh: &NextHop) -> Self {
        Self {
            id: nh.id().as_u32(),
            key: nh.key().to_string(),
            refcount: nh.refcount(),
            state: nh.state(),
            members: nh.composite().map(crate::CompositeNh::member_count),
        }
    }
}

impl NextHopStore {
    /// All nexthops with their reference counts, in id order.
    #[must_use]
    pub fn list(&self) -> Vec<NextHopInfo> {
        self.iter().map(NextHopInfo::from).collect()
    }
}

impl Display for NextHopInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:>6} {:>5} {:<14} {}",
            self.id, self.refcount, self.state, self.key
        )?;
        if let Some(members) = self.members {
            write!(f, " [{members} members]")?;
        }
        Ok(())
    }
}

impl Display for NextHopStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:>6} {:>5} {:<14} KEY", "ID", "REFS", "STATE")?;
        for info in self.list() {
            writeln!(f, "{info}")?;
        }
        Ok(())
    }
}
