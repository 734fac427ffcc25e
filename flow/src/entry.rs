// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow entries

use nexthop::NextHopId;
use resource::ResourceKey;
use std::fmt::Display;
use std::net::IpAddr;

use crate::{FlowAction, FlowFlags, FlowKey, ShortFlowReason};

/// Address translation applied to the packets of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatRewrite {
    pub vrf: u32,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

/// A link-local source port owned by a forward flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLocalBinding {
    pub port: u16,
    pub key: ResourceKey,
}

/// Result of classification. All references are ids, resolved through their stores.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MatchData {
    pub action: FlowAction,
    pub acls: Vec<u32>,
    pub src_vn: Option<u32>,
    pub dst_vn: Option<u32>,
    /// The VM interface this entry is charged to for flow limits.
    pub interface: Option<u32>,
    /// Nexthop the packets of this direction leave through.
    pub dst_nexthop: Option<NextHopId>,
    /// Local VM interface the packets are delivered to, if any.
    pub dst_interface: Option<u32>,
}

/// One direction of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEntry {
    pub(crate) key: FlowKey,
    pub(crate) reverse: Option<FlowKey>,
    pub(crate) flags: FlowFlags,
    pub(crate) short_reason: Option<ShortFlowReason>,
    pub(crate) data: MatchData,
    pub(crate) nat: Option<NatRewrite>,
    pub(crate) linklocal: Option<LinkLocalBinding>,
    pub(crate) ecmp_index: Option<u32>,
    pub(crate) evicted: bool,
}

impl FlowEntry {
    #[must_use]
    pub fn new(key: FlowKey) -> Self {
        Self {
            key,
            reverse: None,
            flags: FlowFlags::empty(),
            short_reason: None,
            data: MatchData::default(),
            nat: None,
            linklocal: None,
            ecmp_index: None,
            evicted: false,
        }
    }

    #[must_use]
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    #[must_use]
    pub fn reverse(&self) -> Option<&FlowKey> {
        self.reverse.as_ref()
    }

    #[must_use]
    pub fn flags(&self) -> FlowFlags {
        self.flags
    }

    #[must_use]
    pub fn is_set(&self, flags: FlowFlags) -> bool {
        self.flags.contains(flags)
    }

    #[must_use]
    pub fn is_short(&self) -> bool {
        self.flags.contains(FlowFlags::SHORT_FLOW)
    }

    #[must_use]
    pub fn is_reverse_flow(&self) -> bool {
        self.flags.contains(FlowFlags::REVERSE_FLOW)
    }

    #[must_use]
    pub fn short_reason(&self) -> Option<ShortFlowReason> {
        self.short_reason.filter(|_| self.is_short())
    }

    /// Mark the flow short. A flow that is already short keeps its first reason.
    pub fn make_short(&mut self, reason: ShortFlowReason) {
        if !self.is_short() {
            self.flags.insert(FlowFlags::SHORT_FLOW);
            self.short_reason = Some(reason);
        }
        self.data.action.remove(FlowAction::PASS);
        self.data.action.insert(FlowAction::DENY);
    }

    #[must_use]
    pub fn data(&self) -> &MatchData {
        &self.data
    }

    #[must_use]
    pub fn action(&self) -> FlowAction {
        self.data.action
    }

    #[must_use]
    pub fn interface(&self) -> Option<u32> {
        self.data.interface
    }

    #[must_use]
    pub fn nat(&self) -> Option<&NatRewrite> {
        self.nat.as_ref()
    }

    /// Source port the packets of this flow leave with: the allocated link-local port, if any,
    /// otherwise the original one.
    #[must_use]
    pub fn linklocal_src_port(&self) -> u16 {
        self.linklocal.map_or(self.key.src_port, |l| l.port)
    }

    /// Whether this flow owns an allocated link-local source port.
    #[must_use]
    pub fn owns_linklocal_port(&self) -> bool {
        self.linklocal.is_some()
    }

    #[must_use]
    pub fn linklocal_binding(&self) -> Option<&LinkLocalBinding> {
        self.linklocal.as_ref()
    }

    #[must_use]
    pub fn nat_src_port(&self) -> u16 {
        self.nat.map_or(self.key.src_port, |n| n.src_port)
    }

    #[must_use]
    pub fn ecmp_index(&self) -> Option<u32> {
        self.ecmp_index
    }

    /// Set when the dataplane slot of this flow was taken by another flow.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    /// Clear classification results before a new evaluation. Identity, link and owned
    /// resources stay.
    pub(crate) fn reset_classification(&mut self) {
        self.flags = FlowFlags::empty();
        self.short_reason = None;
        self.data = MatchData::default();
        self.nat = None;
        self.ecmp_index = None;
    }
}

impl Display for FlowEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)?;
        match &self.reverse {
            Some(r) => write!(f, " <-> {r}")?,
            None => write!(f, " <-> (none)")?,
        }
        write!(f, " flags {:#06x} action {:#04x}", self.flags.bits(), self.action().bits())?;
        if let Some(reason) = self.short_reason() {
            write!(f, " short({reason})")?;
        }
        if let Some(nat) = &self.nat {
            write!(
                f,
                " nat(vrf {} {}:{} -> {}:{})",
                nat.vrf, nat.src_ip, nat.src_port, nat.dst_ip, nat.dst_port
            )?;
        }
        if let Some(index) = self.ecmp_index {
            write!(f, " ecmp {index}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key() -> FlowKey {
        FlowKey::new(
            1,
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 2)),
            FlowKey::PROTO_UDP,
            5000,
            53,
            3,
        )
    }

    #[test]
    fn first_short_reason_sticks() {
        let mut e = FlowEntry::new(key());
        e.data.action = FlowAction::PASS;
        assert_eq!(e.short_reason(), None);
        e.make_short(ShortFlowReason::NoDstRoute);
        e.make_short(ShortFlowReason::FlowLimit);
        assert!(e.is_short());
        assert_eq!(e.short_reason(), Some(ShortFlowReason::NoDstRoute));
        assert_eq!(e.action(), FlowAction::DENY);
        assert!(e.to_string().contains("short(no_dst_route)"));
    }

    #[test]
    fn ports_fall_back_to_key() {
        let mut e = FlowEntry::new(key());
        assert_eq!(e.linklocal_src_port(), 5000);
        assert_eq!(e.nat_src_port(), 5000);
        assert!(!e.owns_linklocal_port());
        e.nat = Some(NatRewrite {
            vrf: 0,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port: 40000,
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dst_port: 8775,
        });
        assert_eq!(e.nat_src_port(), 40000);
    }
}
