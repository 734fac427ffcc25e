// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Nexthop variants and their structural keys.
//!
//! A [`NextHopVariant`] carries everything needed to describe how to deliver a packet. Its
//! [`NextHopKey`] is the subset of that data that makes a nexthop unique: two variants with equal
//! keys designate the same shared nexthop, and any other field is an attribute that may be
//! updated in place.

use bitflags::bitflags;
use resource::ResourceIndex;
use std::fmt::Display;
use std::net::IpAddr;
use strum::{Display as StrumDisplay, EnumIter};

use crate::NextHopId;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

bitflags! {
    /// Encapsulations a tunnel nexthop may use.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct TunnelEncap: u8 {
        const MPLS_GRE = 0b001;
        const MPLS_UDP = 0b010;
        const VXLAN    = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, StrumDisplay)]
#[strum(serialize_all = "kebab-case")]
pub enum CompositeType {
    Fabric,
    L2Comp,
    L3Comp,
    MultiProto,
    Ecmp,
    L2Interface,
    L3Interface,
    LocalEcmp,
    Evpn,
}

/// One occupied member slot of a composite: the shared inner nexthop and the label owned by
/// this slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentNh {
    pub nexthop: NextHopId,
    pub label: ResourceIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeNh {
    pub composite_type: CompositeType,
    pub vrf: u32,
    pub policy: bool,
    /// Tells apart composites of one type in one VRF, e.g. per route or multicast group.
    pub group: u32,
    /// Sparse, ordered member slots. A cleared member leaves a `None` hole.
    pub members: Vec<Option<ComponentNh>>,
}

impl CompositeNh {
    #[must_use]
    pub fn new(composite_type: CompositeType, vrf: u32, policy: bool, group: u32) -> Self {
        Self {
            composite_type,
            vrf,
            policy,
            group,
            members: Vec::new(),
        }
    }

    /// Occupied slots with their position.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &ComponentNh)> {
        self.members
            .iter()
            .enumerate()
            .filter_map(|(slot, m)| m.as_ref().map(|m| (slot, m)))
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.occupied().count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHopVariant {
    Discard,
    Receive {
        vrf: u32,
    },
    Interface {
        interface: u32,
        policy: bool,
        oper_up: bool,
    },
    Arp {
        vrf: u32,
        ip: IpAddr,
        mac: MacAddress,
        interface: u32,
    },
    Tunnel {
        vrf: u32,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        policy: bool,
        encap: TunnelEncap,
    },
    Vrf {
        vrf: u32,
        flood_unknown_unicast: bool,
    },
    Vlan {
        interface: u32,
        tag: u16,
        src_mac: MacAddress,
        dst_mac: MacAddress,
    },
    Mirror {
        vrf: u32,
        src: IpAddr,
        dst: IpAddr,
    },
    Composite(CompositeNh),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NextHopKey {
    Discard,
    Receive {
        vrf: u32,
    },
    Interface {
        interface: u32,
        policy: bool,
    },
    Arp {
        vrf: u32,
        ip: IpAddr,
    },
    Tunnel {
        vrf: u32,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        policy: bool,
        encap: TunnelEncap,
    },
    Vrf {
        vrf: u32,
    },
    Vlan {
        interface: u32,
        tag: u16,
    },
    Mirror {
        vrf: u32,
        src: IpAddr,
        dst: IpAddr,
    },
    /// Members are not part of a composite's identity.
    Composite {
        composite_type: CompositeType,
        vrf: u32,
        policy: bool,
        group: u32,
    },
}

impl NextHopVariant {
    #[must_use]
    pub fn key(&self) -> NextHopKey {
        match self {
            NextHopVariant::Discard => NextHopKey::Discard,
            NextHopVariant::Receive { vrf } => NextHopKey::Receive { vrf: *vrf },
            NextHopVariant::Interface {
                interface, policy, ..
            } => NextHopKey::Interface {
                interface: *interface,
                policy: *policy,
            },
            NextHopVariant::Arp { vrf, ip, .. } => NextHopKey::Arp { vrf: *vrf, ip: *ip },
            NextHopVariant::Tunnel {
                vrf,
                src_ip,
                dst_ip,
                policy,
                encap,
            } => NextHopKey::Tunnel {
                vrf: *vrf,
                src_ip: *src_ip,
                dst_ip: *dst_ip,
                policy: *policy,
                encap: *encap,
            },
            NextHopVariant::Vrf { vrf, .. } => NextHopKey::Vrf { vrf: *vrf },
            NextHopVariant::Vlan { interface, tag, .. } => NextHopKey::Vlan {
                interface: *interface,
                tag: *tag,
            },
            NextHopVariant::Mirror { vrf, src, dst } => NextHopKey::Mirror {
                vrf: *vrf,
                src: *src,
                dst: *dst,
            },
            NextHopVariant::Composite(c) => NextHopKey::Composite {
                composite_type: c.composite_type,
                vrf: c.vrf,
                policy: c.policy,
                group: c.group,
            },
        }
    }

    #[must_use]
    pub fn as_composite(&self) -> Option<&CompositeNh> {
        match self {
            NextHopVariant::Composite(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn as_composite_mut(&mut self) -> Option<&mut CompositeNh> {
        match self {
            NextHopVariant::Composite(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_composite(&self) -> bool {
        matches!(self, NextHopVariant::Composite(_))
    }

    /// Whether this nexthop delivers to a local VM interface.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            NextHopVariant::Interface { .. } | NextHopVariant::Receive { .. }
        )
    }
}

impl Display for NextHopKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NextHopKey::Discard => write!(f, "discard"),
            NextHopKey::Receive { vrf } => write!(f, "receive(vrf {vrf})"),
            NextHopKey::Interface { interface, policy } => {
                write!(f, "interface({interface}, policy={policy})")
            }
            NextHopKey::Arp { vrf, ip } => write!(f, "arp(vrf {vrf}, {ip})"),
            NextHopKey::Tunnel {
                vrf,
                src_ip,
                dst_ip,
                policy,
                encap,
            } => write!(
                f,
                "tunnel(vrf {vrf}, {src_ip} -> {dst_ip}, policy={policy}, encap={:#05b})",
                encap.bits()
            ),
            NextHopKey::Vrf { vrf } => write!(f, "vrf({vrf})"),
            NextHopKey::Vlan { interface, tag } => write!(f, "vlan({interface}.{tag})"),
            NextHopKey::Mirror { vrf, src, dst } => write!(f, "mirror(vrf {vrf}, {src} -> {dst})"),
            NextHopKey::Composite {
                composite_type,
                vrf,
                policy,
                group,
            } => write!(
                f,
                "composite({composite_type}, vrf {vrf}, group {group}, policy={policy})"
            ),
        }
    }
}
