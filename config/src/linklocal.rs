// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Link-local service settings: NAT source and source-port ceilings

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use tracing::warn;

use crate::{ConfigError, ConfigResult};

/// Inclusive range of ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
    #[must_use]
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Builder, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[builder(default)]
#[serde(default, deny_unknown_fields)]
pub struct LinkLocalConfig {
    /// Maximum simultaneous link-local flows across all VMs.
    pub system_flows: u32,
    /// Maximum simultaneous link-local flows per VM.
    pub vm_flows: u32,
    /// Source ports available to link-local NAT.
    pub port_range: PortRange,
    /// Ports held by encapsulation protocols. Never handed out.
    pub reserved_ports: Vec<u16>,
    /// Source address link-local flows are NATed to.
    pub vhost_ip: IpAddr,
    /// VRF in which NATed link-local traffic egresses.
    pub fabric_vrf: u32,
}

impl LinkLocalConfig {
    pub const DEFAULT_MAX_FLOWS: u32 = 2048;
    pub const VXLAN_PORT: u16 = 4789;
    pub const MPLS_UDP_PORT: u16 = 6635;
    pub const EPHEMERAL_PORTS: PortRange = PortRange::new(32768, 60999);

    /// Validate, clamping the per-VM ceiling to the system one.
    pub fn validate(&mut self) -> ConfigResult {
        let range = self.port_range;
        if range.is_empty() || range.start == 0 {
            return Err(ConfigError::BadPortRange(range.start, range.end));
        }
        let usable = (range.start..=range.end)
            .filter(|p| !self.reserved_ports.contains(p))
            .count();
        if usable == 0 {
            return Err(ConfigError::NoUsablePort);
        }
        if self.vm_flows > self.system_flows {
            warn!(
                "Link-local per-VM flows {} exceed system flows {}, clamping",
                self.vm_flows, self.system_flows
            );
            self.vm_flows = self.system_flows;
        }
        Ok(())
    }
}

impl Default for LinkLocalConfig {
    fn default() -> Self {
        Self {
            system_flows: Self::DEFAULT_MAX_FLOWS,
            vm_flows: Self::DEFAULT_MAX_FLOWS,
            port_range: Self::EPHEMERAL_PORTS,
            reserved_ports: vec![Self::VXLAN_PORT, Self::MPLS_UDP_PORT],
            vhost_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            fabric_vrf: 0,
        }
    }
}
