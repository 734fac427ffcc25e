// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! What the flow table needs from the rest of the agent.

use ahash::RandomState;
use nexthop::NextHopId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::debug;

use crate::linklocal::LinkLocalService;
use crate::{FlowEntry, FlowKey};

/// First packet of a new flow, as delivered by the packet-trap layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// VM interface the packet was received on.
    pub interface: u32,
    pub vrf: u32,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_ack: bool,
}

/// A VM interface as seen by the flow table.
pub trait Interface: Send + Sync {
    fn id(&self) -> u32;
    fn vm(&self) -> u32;
    fn vrf(&self) -> u32;
    fn vn(&self) -> Option<u32>;
    /// Nexthop the packets from this interface arrive through.
    fn flow_key_nexthop(&self) -> NextHopId;
    /// The flow ceiling currently in force for this interface. 0 is unlimited.
    fn effective_max_flows(&self) -> u32;
    fn set_drop_new_flows(&self, drop: bool);
    fn drop_new_flows(&self) -> bool;
}

pub trait RouteTable: Send + Sync {
    fn lookup(&self, vrf: u32, dst: IpAddr) -> Option<NextHopId>;
}

/// Configuration edits the flow table must react to.
pub trait ConfigChangeNotifier {
    fn vn_max_flows_changed(&self, vn: u32, max_flows: u32);
    fn interface_max_flows_changed(&self, interface: u32, max_flows: u32);
    fn link_local_service_changed(&self, services: Vec<LinkLocalService>);
}

/// Outbound requests to the dataplane.
pub trait DataplaneSync: Send + Sync {
    fn program_flow(&self, entry: &FlowEntry);
    fn revoke_flow(&self, key: &FlowKey);
}

/// Host routes, exact match on the destination address.
#[derive(Default)]
pub struct StaticRouteTable {
    routes: RwLock<HashMap<(u32, IpAddr), NextHopId, RandomState>>,
}

impl StaticRouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, vrf: u32, dst: IpAddr, nh: NextHopId) -> Option<NextHopId> {
        debug!("Route vrf {vrf} {dst} -> nh {nh}");
        self.routes.write().insert((vrf, dst), nh)
    }

    pub fn remove(&self, vrf: u32, dst: IpAddr) -> Option<NextHopId> {
        self.routes.write().remove(&(vrf, dst))
    }

    /// Remove every route. Returns the nexthops they pointed to.
    pub fn clear(&self) -> Vec<NextHopId> {
        self.routes.write().drain().map(|(_, nh)| nh).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl RouteTable for StaticRouteTable {
    fn lookup(&self, vrf: u32, dst: IpAddr) -> Option<NextHopId> {
        self.routes.read().get(&(vrf, dst)).copied()
    }
}

/// A dataplane that only traces the requests it gets.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDataplane;

impl DataplaneSync for TracingDataplane {
    fn program_flow(&self, entry: &FlowEntry) {
        debug!("program: {entry}");
    }
    fn revoke_flow(&self, key: &FlowKey) {
        debug!("revoke: {key}");
    }
}
