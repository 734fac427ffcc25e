// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow accounting scopes: VM interfaces, virtual networks and VMs.

use ahash::RandomState;
use dashmap::DashMap;
use derive_builder::Builder;
use nexthop::NextHopId;
use parking_lot::{Mutex, RwLock};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, info};

use crate::Interface;

/// Where the flow ceiling of an interface comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    Interface,
    Vn,
    /// The global per-VM ceiling, compared against the flow count of the whole VM.
    Vm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimit {
    pub limit: u32,
    pub source: LimitSource,
}

/// A floating IP: the public address and VRF a VM interface is NATed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloatingIp {
    pub ip: IpAddr,
    pub vrf: u32,
}

#[derive(Builder, Debug, Clone, PartialEq, Eq)]
#[builder(setter(into))]
pub struct VmInterfaceConfig {
    pub id: u32,
    pub vm: u32,
    #[builder(default)]
    pub vn: Option<u32>,
    pub vrf: u32,
    pub ip: IpAddr,
    #[builder(default)]
    pub flow_key_nexthop: NextHopId,
    /// Interface flow ceiling, 0 defers to the virtual network.
    #[builder(default)]
    pub max_flows: u32,
    #[builder(default)]
    pub floating_ips: Vec<FloatingIp>,
    /// Require a route back to the source.
    #[builder(default)]
    pub rpf: bool,
}

pub struct VmInterface {
    config: VmInterfaceConfig,
    flow_key_nexthop: AtomicU32,
    max_flows: AtomicU32,
    floating_ips: RwLock<Vec<FloatingIp>>,
    cached_limit: Mutex<Option<EffectiveLimit>>,
    drop_new_flows: AtomicBool,
    flow_count: AtomicU32,
}

impl VmInterface {
    #[must_use]
    pub fn new(config: VmInterfaceConfig) -> Self {
        Self {
            flow_key_nexthop: AtomicU32::new(config.flow_key_nexthop.as_u32()),
            max_flows: AtomicU32::new(config.max_flows),
            floating_ips: RwLock::new(config.floating_ips.clone()),
            cached_limit: Mutex::new(None),
            drop_new_flows: AtomicBool::new(false),
            flow_count: AtomicU32::new(0),
            config,
        }
    }

    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.config.ip
    }

    #[must_use]
    pub fn rpf(&self) -> bool {
        self.config.rpf
    }

    #[must_use]
    pub fn max_flows(&self) -> u32 {
        self.max_flows.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_flows(&self, max_flows: u32) {
        self.max_flows.store(max_flows, Ordering::Relaxed);
        self.invalidate_limit();
    }

    pub fn set_flow_key_nexthop(&self, nh: NextHopId) {
        self.flow_key_nexthop.store(nh.as_u32(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn floating_ips(&self) -> Vec<FloatingIp> {
        self.floating_ips.read().clone()
    }

    pub fn set_floating_ips(&self, fips: Vec<FloatingIp>) {
        *self.floating_ips.write() = fips;
    }

    #[must_use]
    pub fn flow_count(&self) -> u32 {
        self.flow_count.load(Ordering::Relaxed)
    }

    pub(crate) fn cached_limit(&self) -> Option<EffectiveLimit> {
        *self.cached_limit.lock()
    }

    pub(crate) fn cache_limit(&self, limit: EffectiveLimit) {
        *self.cached_limit.lock() = Some(limit);
    }

    pub(crate) fn invalidate_limit(&self) {
        *self.cached_limit.lock() = None;
    }
}

impl Interface for VmInterface {
    fn id(&self) -> u32 {
        self.config.id
    }
    fn vm(&self) -> u32 {
        self.config.vm
    }
    fn vrf(&self) -> u32 {
        self.config.vrf
    }
    fn vn(&self) -> Option<u32> {
        self.config.vn
    }
    fn flow_key_nexthop(&self) -> NextHopId {
        NextHopId::new(self.flow_key_nexthop.load(Ordering::Relaxed))
    }
    fn effective_max_flows(&self) -> u32 {
        self.cached_limit().map_or(0, |l| l.limit)
    }
    fn set_drop_new_flows(&self, drop: bool) {
        if self.drop_new_flows.swap(drop, Ordering::Relaxed) != drop {
            info!(
                "Interface {}: drop new flows {}",
                self.config.id,
                if drop { "on" } else { "off" }
            );
        }
    }
    fn drop_new_flows(&self) -> bool {
        self.drop_new_flows.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct VnScope {
    max_flows: AtomicU32,
    flow_count: AtomicU32,
}

impl VnScope {
    #[must_use]
    pub fn max_flows(&self) -> u32 {
        self.max_flows.load(Ordering::Relaxed)
    }
    #[must_use]
    pub fn flow_count(&self) -> u32 {
        self.flow_count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct VmScope {
    flow_count: AtomicU32,
}

impl VmScope {
    #[must_use]
    pub fn flow_count(&self) -> u32 {
        self.flow_count.load(Ordering::Relaxed)
    }
}

/// Registry of the accounting scopes.
pub struct Scopes {
    interfaces: DashMap<u32, Arc<VmInterface>, RandomState>,
    vns: DashMap<u32, Arc<VnScope>, RandomState>,
    vms: DashMap<u32, Arc<VmScope>, RandomState>,
}

impl Default for Scopes {
    fn default() -> Self {
        Self {
            interfaces: DashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
            vns: DashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
            vms: DashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
        }
    }
}

impl Scopes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interface(&self, config: VmInterfaceConfig) -> Arc<VmInterface> {
        let intf = Arc::new(VmInterface::new(config));
        debug!(
            "Interface {} (vm {}, vn {:?}, vrf {})",
            intf.id(),
            intf.vm(),
            intf.vn(),
            intf.vrf()
        );
        self.vms.entry(intf.vm()).or_default();
        if let Some(vn) = intf.vn() {
            self.vns.entry(vn).or_default();
        }
        self.interfaces.insert(intf.id(), intf.clone());
        intf
    }

    pub fn remove_interface(&self, id: u32) -> Option<Arc<VmInterface>> {
        self.interfaces.remove(&id).map(|(_, intf)| intf)
    }

    #[must_use]
    pub fn interface(&self, id: u32) -> Option<Arc<VmInterface>> {
        self.interfaces.get(&id).map(|i| i.value().clone())
    }

    #[must_use]
    pub fn interfaces(&self) -> Vec<Arc<VmInterface>> {
        self.interfaces.iter().map(|i| i.value().clone()).collect()
    }

    #[must_use]
    pub fn interfaces_in_vn(&self, vn: u32) -> Vec<Arc<VmInterface>> {
        self.interfaces
            .iter()
            .filter(|i| i.vn() == Some(vn))
            .map(|i| i.value().clone())
            .collect()
    }

    #[must_use]
    pub fn vn(&self, vn: u32) -> Option<Arc<VnScope>> {
        self.vns.get(&vn).map(|v| v.value().clone())
    }

    #[must_use]
    pub fn vm(&self, vm: u32) -> Option<Arc<VmScope>> {
        self.vms.get(&vm).map(|v| v.value().clone())
    }

    pub(crate) fn set_vn_max_flows(&self, vn: u32, max_flows: u32) {
        self.vns
            .entry(vn)
            .or_default()
            .max_flows
            .store(max_flows, Ordering::Relaxed);
    }

    #[must_use]
    pub fn vm_flow_count(&self, vm: u32) -> u32 {
        self.vm(vm).map_or(0, |v| v.flow_count())
    }

    pub(crate) fn flow_added(&self, intf: &VmInterface) {
        intf.flow_count.fetch_add(1, Ordering::Relaxed);
        if let Some(vm) = self.vm(intf.vm()) {
            vm.flow_count.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(vn) = intf.vn().and_then(|vn| self.vn(vn)) {
            vn.flow_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn flow_removed(&self, intf: &VmInterface) {
        let dec = |c: &AtomicU32| {
            // never wraps below zero
            let _ = c.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        };
        dec(&intf.flow_count);
        if let Some(vm) = self.vm(intf.vm()) {
            dec(&vm.flow_count);
        }
        if let Some(vn) = intf.vn().and_then(|vn| self.vn(vn)) {
            dec(&vn.flow_count);
        }
    }
}
