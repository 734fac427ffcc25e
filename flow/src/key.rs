// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::fmt::Display;
use std::net::IpAddr;

/// Identity of one direction of a flow.
///
/// `nexthop_id` is the nexthop the packets of this direction arrive through. It keeps apart
/// flows whose addresses overlap but that enter through different interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub vrf_id: u32,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub nexthop_id: u32,
}

impl FlowKey {
    pub const PROTO_ICMP: u8 = 1;
    pub const PROTO_TCP: u8 = 6;
    pub const PROTO_UDP: u8 = 17;

    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vrf_id: u32,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        protocol: u8,
        src_port: u16,
        dst_port: u16,
        nexthop_id: u32,
    ) -> Self {
        Self {
            vrf_id,
            src_ip,
            dst_ip,
            protocol,
            src_port,
            dst_port,
            nexthop_id,
        }
    }

    /// Whether `other` is the opposite direction of `self`, whatever nexthop it arrives through.
    #[must_use]
    pub fn is_reverse_of(&self, other: &FlowKey) -> bool {
        self.vrf_id == other.vrf_id
            && self.protocol == other.protocol
            && self.src_ip == other.dst_ip
            && self.dst_ip == other.src_ip
            && self.src_port == other.dst_port
            && self.dst_port == other.src_port
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let proto = match self.protocol {
            Self::PROTO_TCP => "TCP".to_string(),
            Self::PROTO_UDP => "UDP".to_string(),
            Self::PROTO_ICMP => "ICMP".to_string(),
            other => other.to_string(),
        };
        write!(
            f,
            "{{ vrf {} [proto: {proto}] ({}:{}, {}:{}) nh {} }}",
            self.vrf_id, self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.nexthop_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::FlowKey;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn reverse_ignores_nexthop() {
        let a = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        let b = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 2));
        let fwd = FlowKey::new(1, a, b, FlowKey::PROTO_TCP, 1000, 80, 5);
        let rev = FlowKey::new(1, b, a, FlowKey::PROTO_TCP, 80, 1000, 9);
        assert!(rev.is_reverse_of(&fwd));
        assert!(fwd.is_reverse_of(&rev));
        assert!(!fwd.is_reverse_of(&fwd));
        assert_eq!(
            fwd.to_string(),
            "{ vrf 1 [proto: TCP] (1.1.1.1:1000, 1.1.1.2:80) nh 5 }"
        );
    }
}
