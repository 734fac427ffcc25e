// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Test support: a recording dataplane and a wired flow table.

#![allow(clippy::unwrap_used)]

use config::{AgentConfig, FlowConfigBuilder, LinkLocalConfig, PortRange};
use nexthop::{ForwardingState, NextHopId, NextHopVariant, SharedForwardingState, TunnelEncap};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::{
    DataplaneSync, FlowEntry, FlowKey, FlowTable, LinkLocalService, PacketInfo, Scopes,
    StaticRouteTable, VmInterface, VmInterfaceConfigBuilder,
};

pub(crate) const VRF: u32 = 1;
pub(crate) const FABRIC_VRF: u32 = 0;

pub(crate) fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

pub(crate) fn vhost_ip() -> IpAddr {
    ip(10, 1, 1, 100)
}

pub(crate) fn metadata() -> LinkLocalService {
    LinkLocalService {
        name: "metadata",
        service_ip: ip(169, 254, 169, 254),
        service_port: 80,
        fabric_ip: ip(10, 1, 1, 1),
        fabric_port: 8775,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Program(FlowKey),
    Revoke(FlowKey),
}

#[derive(Default)]
pub(crate) struct RecordingDataplane {
    events: Mutex<Vec<Event>>,
}

impl RecordingDataplane {
    pub(crate) fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl DataplaneSync for RecordingDataplane {
    fn program_flow(&self, entry: &FlowEntry) {
        self.events.lock().push(Event::Program(entry.key));
    }
    fn revoke_flow(&self, key: &FlowKey) {
        self.events.lock().push(Event::Revoke(*key));
    }
}

pub(crate) fn config(linklocal_vm: u32, linklocal_system: u32) -> AgentConfig {
    AgentConfig {
        flow: FlowConfigBuilder::default().shards(4_usize).build().unwrap(),
        linklocal: LinkLocalConfig {
            system_flows: linklocal_system,
            vm_flows: linklocal_vm,
            port_range: PortRange::new(40000, 40099),
            vhost_ip: vhost_ip(),
            fabric_vrf: FABRIC_VRF,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) struct Fixture {
    pub(crate) table: FlowTable,
    pub(crate) routes: Arc<StaticRouteTable>,
    pub(crate) forwarding: SharedForwardingState,
    pub(crate) scopes: Arc<Scopes>,
    pub(crate) dataplane: Arc<RecordingDataplane>,
}

impl Fixture {
    pub(crate) fn new(config: &AgentConfig) -> Self {
        let scopes = Arc::new(Scopes::new());
        let forwarding = ForwardingState::shared(config).unwrap();
        let routes = Arc::new(StaticRouteTable::new());
        let dataplane = Arc::new(RecordingDataplane::default());
        let table = FlowTable::new(
            config,
            scopes.clone(),
            forwarding.clone(),
            routes.clone(),
            dataplane.clone(),
        )
        .unwrap();
        table.linklocal_services().replace(&[metadata()]);
        let fixture = Self {
            table,
            routes,
            forwarding,
            scopes,
            dataplane,
        };
        // the metadata server sits behind the fabric
        fixture.remote_route(FABRIC_VRF, metadata().fabric_ip);
        fixture
    }

    pub(crate) fn with_defaults() -> Self {
        Self::new(&config(
            LinkLocalConfig::DEFAULT_MAX_FLOWS,
            LinkLocalConfig::DEFAULT_MAX_FLOWS,
        ))
    }

    fn nexthop(&self, variant: NextHopVariant) -> NextHopId {
        let mut guard = self.forwarding.lock();
        let fs = &mut *guard;
        fs.nexthops.find_or_create(variant, &mut fs.resources)
    }

    /// Register a VM interface with address 10.0.0.`id` in [`VRF`], and a route to it.
    pub(crate) fn interface(&self, id: u8, vm: u32, vn: u32) -> Arc<VmInterface> {
        let nh = self.nexthop(NextHopVariant::Interface {
            interface: u32::from(id),
            policy: false,
            oper_up: true,
        });
        let addr = ip(10, 0, 0, id);
        self.routes.add(VRF, addr, nh);
        self.scopes.add_interface(
            VmInterfaceConfigBuilder::default()
                .id(u32::from(id))
                .vm(vm)
                .vn(vn)
                .vrf(VRF)
                .ip(addr)
                .flow_key_nexthop(nh)
                .build()
                .unwrap(),
        )
    }

    pub(crate) fn remote_route(&self, vrf: u32, dst: IpAddr) -> NextHopId {
        let nh = self.nexthop(NextHopVariant::Tunnel {
            vrf: FABRIC_VRF,
            src_ip: vhost_ip(),
            dst_ip: ip(192, 168, 0, 1),
            policy: false,
            encap: TunnelEncap::MPLS_GRE,
        });
        self.routes.add(vrf, dst, nh);
        nh
    }
}

pub(crate) fn udp(
    interface: &VmInterface,
    dst: IpAddr,
    src_port: u16,
    dst_port: u16,
) -> PacketInfo {
    PacketInfo {
        interface: crate::Interface::id(interface),
        vrf: VRF,
        src_ip: interface.ip(),
        dst_ip: dst,
        protocol: FlowKey::PROTO_UDP,
        src_port,
        dst_port,
        tcp_ack: false,
    }
}
