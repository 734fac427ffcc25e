// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Classification of new flows: route lookup, NAT, ECMP member selection and link-local
//! source port binding.

use nexthop::{NextHopId, NextHopVariant};
use resource::{LinkLocalPortKey, ResourceKey};
use std::hash::BuildHasher;
use tracing::debug;

use crate::entry::{LinkLocalBinding, NatRewrite};
use crate::linklocal::LinkLocalService;
use crate::scope::VmInterface;
use crate::table::{FlowTable, hasher_state};
use crate::{
    FlowAction, FlowEntry, FlowFlags, FlowKey, Interface, PacketInfo, ShortFlowReason,
};

/// Keys of the pair committed for a new flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewFlow {
    pub forward: FlowKey,
    pub reverse: FlowKey,
}

/// Flags a reverse entry takes over from its forward.
const MIRRORED: FlowFlags = FlowFlags::NAT_FLOW
    .union(FlowFlags::LINK_LOCAL_FLOW)
    .union(FlowFlags::LOCAL_FLOW);

/// Hash of the 5-tuple, used to pick an ECMP member. Stable for the life of the process.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn flow_hash(key: &FlowKey) -> u32 {
    hasher_state().hash_one((
        key.src_ip,
        key.dst_ip,
        key.protocol,
        key.src_port,
        key.dst_port,
    )) as u32
}

/// Key of the reverse direction of a classified forward entry.
#[must_use]
pub fn reverse_key(fwd: &FlowEntry) -> FlowKey {
    let key = &fwd.key;
    let (vrf, src_ip, src_port, dst_ip, dst_port) = match &fwd.nat {
        Some(n) => (n.vrf, n.src_ip, n.src_port, n.dst_ip, n.dst_port),
        None => (
            key.vrf_id,
            key.src_ip,
            key.src_port,
            key.dst_ip,
            key.dst_port,
        ),
    };
    FlowKey::new(
        vrf,
        dst_ip,
        src_ip,
        key.protocol,
        dst_port,
        src_port,
        fwd.data
            .dst_nexthop
            .unwrap_or(NextHopId::INVALID)
            .as_u32(),
    )
}

impl FlowTable {
    ////////////////////////////////////////////////////////////////////////
    /// Handle the first packet of a flow: classify both directions and commit them.
    ////////////////////////////////////////////////////////////////////////
    pub fn process_new_flow(&self, pkt: &PacketInfo) -> NewFlow {
        let nexthop = self
            .scopes
            .interface(pkt.interface)
            .map_or(NextHopId::INVALID, |i| i.flow_key_nexthop());
        let key = FlowKey::new(
            pkt.vrf,
            pkt.src_ip,
            pkt.dst_ip,
            pkt.protocol,
            pkt.src_port,
            pkt.dst_port,
            nexthop.as_u32(),
        );
        let mut fwd = self.allocate(key);
        self.init_forward(&mut fwd, pkt);
        let rkey = reverse_key(&fwd);
        let mut rev = self.allocate(rkey);
        self.init_reverse(&mut rev, &fwd);
        debug!("new flow: {fwd}");
        self.add(fwd, rev);
        NewFlow {
            forward: key,
            reverse: rkey,
        }
    }

    /// Classify a forward entry from the packet that created it.
    pub fn init_forward(&self, entry: &mut FlowEntry, pkt: &PacketInfo) {
        entry.reset_classification();
        entry.flags.insert(FlowFlags::INGRESS_DIR);
        if pkt.tcp_ack {
            entry.flags.insert(FlowFlags::TCP_ACK_FLOW);
        }
        let Some(intf) = self.scopes.interface(pkt.interface) else {
            self.shorten(entry, ShortFlowReason::UnavailableInterface);
            return;
        };
        entry.data.interface = Some(intf.id());
        entry.data.src_vn = intf.vn();
        entry.data.action = FlowAction::PASS;
        if entry.key.vrf_id == u32::MAX {
            self.shorten(entry, ShortFlowReason::UnavailableVrf);
            return;
        }

        let key = entry.key;
        if let Some(service) = self.linklocal.lookup(key.dst_ip, key.dst_port) {
            self.init_linklocal(entry, &intf, &service);
        } else {
            self.drop_port(entry);
        }

        let (vrf, dst) = entry
            .nat
            .map_or((key.vrf_id, key.dst_ip), |n| (n.vrf, n.dst_ip));
        let mut route = self.routes.lookup(vrf, dst);
        if route.is_none() && entry.nat.is_none() {
            route = self.floating_ip_route(entry, &intf);
        }
        match route {
            Some(nh) => self.resolve_destination(entry, nh),
            None => self.shorten(entry, ShortFlowReason::NoDstRoute),
        }

        if intf.rpf() && self.routes.lookup(key.vrf_id, key.src_ip).is_none() {
            self.shorten(entry, ShortFlowReason::NoSrcRoute);
        }
        if entry.is_set(FlowFlags::NAT_FLOW) && !entry.is_short() {
            entry.data.action.insert(FlowAction::NAT);
        }
    }

    fn init_linklocal(
        &self,
        entry: &mut FlowEntry,
        intf: &VmInterface,
        service: &LinkLocalService,
    ) {
        entry
            .flags
            .insert(FlowFlags::LINK_LOCAL_FLOW | FlowFlags::NAT_FLOW);
        let port = match entry.linklocal {
            Some(binding) => Some(binding.port),
            None => self.bind_port(entry, intf),
        };
        match port {
            Some(_) => entry.flags.insert(FlowFlags::LINK_LOCAL_BIND_LOCAL_SRC_PORT),
            None => entry.make_short(ShortFlowReason::LinkLocalSrcNat),
        }
        let cfg = &self.linklocal_config;
        entry.nat = Some(NatRewrite {
            vrf: cfg.fabric_vrf,
            src_ip: cfg.vhost_ip,
            src_port: port.unwrap_or(entry.key.src_port),
            dst_ip: service.fabric_ip,
            dst_port: service.fabric_port,
        });
    }

    fn bind_port(&self, entry: &mut FlowEntry, intf: &VmInterface) -> Option<u16> {
        let key = ResourceKey::LinkLocalPort(LinkLocalPortKey {
            vm: intf.vm(),
            vrf: entry.key.vrf_id,
            protocol: entry.key.protocol,
            src_ip: entry.key.src_ip,
            src_port: entry.key.src_port,
            dst_ip: entry.key.dst_ip,
            dst_port: entry.key.dst_port,
        });
        let index = self.forwarding.lock().resources.allocate(key);
        let Some(port) = index.valid().and_then(|i| u16::try_from(i.as_u32()).ok()) else {
            debug!("No link-local port for {}", entry.key);
            return None;
        };
        entry.linklocal = Some(LinkLocalBinding { port, key });
        Some(port)
    }

    /// Route through a floating IP of the interface, translating the source.
    fn floating_ip_route(&self, entry: &mut FlowEntry, intf: &VmInterface) -> Option<NextHopId> {
        let key = entry.key;
        intf.floating_ips().into_iter().find_map(|fip| {
            let nh = self.routes.lookup(fip.vrf, key.dst_ip)?;
            entry.flags.insert(FlowFlags::NAT_FLOW);
            entry.nat = Some(NatRewrite {
                vrf: fip.vrf,
                src_ip: fip.ip,
                src_port: key.src_port,
                dst_ip: key.dst_ip,
                dst_port: key.dst_port,
            });
            Some(nh)
        })
    }

    fn resolve_destination(&self, entry: &mut FlowEntry, nh: NextHopId) {
        let (nh, dst_interface) = {
            let fs = self.forwarding.lock();
            let Some(nexthop) = fs.nexthops.get(nh) else {
                drop(fs);
                self.shorten(entry, ShortFlowReason::NoDstRoute);
                return;
            };
            let nh = if nexthop.composite().is_some() {
                let Some((slot, member)) = fs.nexthops.ecmp_member(nh, flow_hash(&entry.key))
                else {
                    drop(fs);
                    self.shorten(entry, ShortFlowReason::NoDstRoute);
                    return;
                };
                entry.flags.insert(FlowFlags::ECMP_FLOW);
                entry.ecmp_index = u32::try_from(slot).ok();
                member.nexthop
            } else {
                nh
            };
            let dst_interface = match fs.nexthops.get(nh).map(|n| n.variant()) {
                Some(NextHopVariant::Interface { interface, .. }) => Some(*interface),
                Some(NextHopVariant::Discard) => {
                    entry.data.action = FlowAction::DENY;
                    None
                }
                _ => None,
            };
            (nh, dst_interface)
        };
        entry.data.dst_nexthop = Some(nh);
        if let Some(intf) = dst_interface.and_then(|i| self.scopes.interface(i)) {
            entry.flags.insert(FlowFlags::LOCAL_FLOW);
            entry.data.dst_interface = Some(intf.id());
            entry.data.dst_vn = intf.vn();
        }
    }

    /// Derive a reverse entry from its classified forward.
    pub fn init_reverse(&self, rev: &mut FlowEntry, fwd: &FlowEntry) {
        rev.reset_classification();
        self.drop_port(rev);
        rev.flags.insert(FlowFlags::REVERSE_FLOW | (fwd.flags & MIRRORED));
        rev.data.interface = fwd.data.dst_interface.or(fwd.data.interface);
        rev.data.dst_interface = fwd.data.interface;
        rev.data.src_vn = fwd.data.dst_vn;
        rev.data.dst_vn = fwd.data.src_vn;
        rev.data.action = fwd.data.action;
        rev.data.dst_nexthop = NextHopId::new(fwd.key.nexthop_id).valid();
        if fwd.nat.is_some() {
            rev.nat = Some(NatRewrite {
                vrf: fwd.key.vrf_id,
                src_ip: fwd.key.dst_ip,
                src_port: fwd.key.dst_port,
                dst_ip: fwd.key.src_ip,
                dst_port: fwd.key.src_port,
            });
        }
        if let Some(reason) = fwd.short_reason() {
            rev.make_short(reason);
        }
    }
}
