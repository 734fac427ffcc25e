// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Keys under which resources are allocated

use std::fmt::Display;
use std::net::IpAddr;
use strum::{Display as StrumDisplay, EnumIter, IntoStaticStr};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, IntoStaticStr, StrumDisplay,
)]
pub enum ResourceKind {
    #[strum(serialize = "mpls-label")]
    MplsLabel,
    #[strum(serialize = "link-local-port")]
    LinkLocalPort,
}

/// The flow a link-local source port is bound for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkLocalPortKey {
    pub vm: u32,
    pub vrf: u32,
    pub protocol: u8,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

/// Structural identity of an allocated resource.
///
/// Two structurally equal keys always designate the same index while that index is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    /// Label of a VM interface nexthop.
    InterfaceLabel { interface: u32, policy: bool },
    /// Label terminating in a VRF.
    VrfLabel { vrf: u32 },
    /// Label owned by one member slot of a composite nexthop.
    ComponentLabel { composite: u32, member: u32 },
    LinkLocalPort(LinkLocalPortKey),
}

impl ResourceKey {
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceKey::InterfaceLabel { .. }
            | ResourceKey::VrfLabel { .. }
            | ResourceKey::ComponentLabel { .. } => ResourceKind::MplsLabel,
            ResourceKey::LinkLocalPort(_) => ResourceKind::LinkLocalPort,
        }
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKey::InterfaceLabel { interface, policy } => {
                write!(f, "intf-label({interface}, policy={policy})")
            }
            ResourceKey::VrfLabel { vrf } => write!(f, "vrf-label({vrf})"),
            ResourceKey::ComponentLabel { composite, member } => {
                write!(f, "component-label({composite}/{member})")
            }
            ResourceKey::LinkLocalPort(k) => write!(
                f,
                "ll-port(vm {} vrf {} {}:{} -> {}:{} proto {})",
                k.vm, k.vrf, k.src_ip, k.src_port, k.dst_ip, k.dst_port, k.protocol
            ),
        }
    }
}
