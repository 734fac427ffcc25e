// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The forwarding-control core of the vrouter agent.
//!
//! [`Agent`] owns the process-wide state and wires it together: the interface scopes, the
//! forwarding state (nexthops and the resources they hold), the route table and the flow table.
//! The dataplane is a listener on the forwarding state: whatever the agent programs holds
//! dataplane state until the dataplane acknowledges its removal, and nothing it depends on is
//! reused before that.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

mod errors;

pub use errors::AgentError;

use config::AgentConfig;
use flow::{
    DataplaneSync, FlowStats, FlowTable, Interface, Scopes, StaticRouteTable, VmInterface,
    VmInterfaceConfig,
};
use nexthop::{
    CompositeNh, ForwardingState, GcReport, NextHopId, NextHopVariant, SharedForwardingState,
};
use parking_lot::Mutex;
use resource::{
    DbState, EntryId, ListenerId, ResourceIndex, ResourceKey, ResourceKind, ResourceManager,
};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use tracectl::{LevelFilter, trace_target};
trace_target!("agent", LevelFilter::INFO, &["agent"]);

/// A one-shot view of the agent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSummary {
    pub interfaces: usize,
    pub routes: usize,
    pub nexthops: usize,
    pub labels: usize,
    pub ports: usize,
    pub flows: FlowStats,
}

impl Display for AgentSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Agent")?;
        writeln!(f, "  interfaces      : {}", self.interfaces)?;
        writeln!(f, "  routes          : {}", self.routes)?;
        writeln!(f, "  nexthops        : {}", self.nexthops)?;
        writeln!(f, "  mpls labels     : {}", self.labels)?;
        writeln!(f, "  link-local ports: {}", self.ports)?;
        write!(f, "{}", self.flows)
    }
}

pub struct Agent {
    scopes: Arc<Scopes>,
    forwarding: SharedForwardingState,
    routes: Arc<StaticRouteTable>,
    flows: Arc<FlowTable>,
    dataplane: ListenerId,
    interface_labels: Mutex<BTreeMap<u32, ResourceIndex>>,
}

impl Agent {
    pub fn new(
        config: &AgentConfig,
        dataplane: Arc<dyn DataplaneSync>,
    ) -> Result<Self, AgentError> {
        let forwarding = ForwardingState::shared(config)?;
        let listener = forwarding.lock().resources.register_listener("dataplane");
        let scopes = Arc::new(Scopes::new());
        let routes = Arc::new(StaticRouteTable::new());
        let flows = Arc::new(FlowTable::new(
            config,
            scopes.clone(),
            forwarding.clone(),
            routes.clone(),
            dataplane,
        )?);
        info!(
            "Agent ready: {} flow shards, {} labels from {}",
            flows.num_shards(),
            config.mpls.label_count,
            config.mpls.label_start
        );
        Ok(Self {
            scopes,
            forwarding,
            routes,
            flows,
            dataplane: listener,
            interface_labels: Mutex::new(BTreeMap::new()),
        })
    }

    #[must_use]
    pub fn flows(&self) -> &Arc<FlowTable> {
        &self.flows
    }

    #[must_use]
    pub fn scopes(&self) -> &Arc<Scopes> {
        &self.scopes
    }

    #[must_use]
    pub fn routes(&self) -> &Arc<StaticRouteTable> {
        &self.routes
    }

    #[must_use]
    pub fn forwarding(&self) -> &SharedForwardingState {
        &self.forwarding
    }

    /// Record that the dataplane now holds nexthop `nh`.
    fn program(&self, rm: &mut ResourceManager, nh: NextHopId) {
        let entry = EntryId::NextHop(nh.as_u32());
        if let Err(e) = rm.set_state(entry, self.dataplane, DbState { handle: nh.as_u32() }) {
            error!("Could not record dataplane state for nexthop {nh}: {e}");
        }
    }

    fn create(
        &self,
        fs: &mut ForwardingState,
        variant: NextHopVariant,
    ) -> Result<NextHopId, AgentError> {
        let key = variant.key();
        let nh = fs.nexthops.find_or_create(variant, &mut fs.resources);
        if nh.is_invalid() {
            return Err(AgentError::NextHopExhausted(key.to_string()));
        }
        self.program(&mut fs.resources, nh);
        Ok(nh)
    }

    /// Point the route for `dst` in `vrf` to `nh`, which carries one reference for the route.
    fn install_route(&self, fs: &mut ForwardingState, vrf: u32, dst: IpAddr, nh: NextHopId) {
        if let Some(old) = self.routes.add(vrf, dst, nh)
            && let Err(e) = fs.nexthops.release(old)
        {
            warn!("Route {vrf}/{dst} pointed to a missing nexthop: {e}");
        }
    }

    ////////////////////////////////////////////////////////////////////////
    /// Add (or refresh) a VM interface.
    ///
    /// The interface gets a nexthop, which also identifies the flows it originates, an MPLS
    /// label bound to that nexthop and a host route to its address.
    ////////////////////////////////////////////////////////////////////////
    pub fn add_interface(
        &self,
        mut config: VmInterfaceConfig,
    ) -> Result<Arc<VmInterface>, AgentError> {
        let id = config.id;
        let (vrf, ip) = (config.vrf, config.ip);
        let nh = {
            let mut guard = self.forwarding.lock();
            let fs = &mut *guard;
            let nh = self.create(
                fs,
                NextHopVariant::Interface {
                    interface: id,
                    policy: false,
                    oper_up: true,
                },
            )?;
            let label = fs.nexthops.bind_label(
                ResourceKey::InterfaceLabel {
                    interface: id,
                    policy: false,
                },
                nh,
                &mut fs.resources,
            )?;
            if label.is_valid() {
                if let Some(old) = self.interface_labels.lock().insert(id, label) {
                    fs.nexthops.unbind_label(old, &mut fs.resources)?;
                }
            } else {
                warn!("Interface {id} has no label");
            }
            self.install_route(fs, vrf, ip, nh);
            nh
        };
        config.flow_key_nexthop = nh;
        let intf = match self.scopes.interface(id) {
            Some(existing) => {
                existing.set_flow_key_nexthop(nh);
                existing
            }
            None => self.scopes.add_interface(config),
        };
        debug!("Interface {id} on nexthop {nh}");
        Ok(intf)
    }

    /// Remove a VM interface: its flows, its route and its label. Its nexthop goes away once
    /// the dataplane acknowledges the label withdrawal.
    pub fn remove_interface(&self, id: u32) -> Result<(), AgentError> {
        let intf = self
            .scopes
            .interface(id)
            .ok_or(AgentError::UnknownInterface(id))?;
        let flows: Vec<_> = self
            .flows
            .entries()
            .into_iter()
            .filter(|e| e.interface() == Some(id))
            .map(|e| *e.key())
            .collect();
        for key in &flows {
            self.flows.delete(key, true);
        }
        self.scopes.remove_interface(id);

        let route = self.routes.remove(intf.vrf(), intf.ip());
        let label = self.interface_labels.lock().remove(&id);
        let mut guard = self.forwarding.lock();
        let fs = &mut *guard;
        if let Some(nh) = route {
            fs.nexthops.release(nh)?;
        }
        if let Some(label) = label {
            fs.nexthops.unbind_label(label, &mut fs.resources)?;
        }
        info!("Removed interface {id} and {} flows", flows.len());
        Ok(())
    }

    #[must_use]
    pub fn interface_label(&self, id: u32) -> Option<ResourceIndex> {
        self.interface_labels.lock().get(&id).copied()
    }

    /// Route `dst` in `vrf` to a nexthop built from `variant`.
    pub fn add_route(
        &self,
        vrf: u32,
        dst: IpAddr,
        variant: NextHopVariant,
    ) -> Result<NextHopId, AgentError> {
        let mut guard = self.forwarding.lock();
        let fs = &mut *guard;
        let nh = self.create(fs, variant)?;
        self.install_route(fs, vrf, dst, nh);
        Ok(nh)
    }

    /// Route `dst` in `vrf` to a composite of `members`. Rebuilding an existing composite keeps
    /// the slots of the members it still has.
    pub fn add_composite_route(
        &self,
        vrf: u32,
        dst: IpAddr,
        composite: CompositeNh,
        members: Vec<NextHopVariant>,
    ) -> Result<NextHopId, AgentError> {
        let mut guard = self.forwarding.lock();
        let fs = &mut *guard;
        let mut created = Vec::with_capacity(members.len());
        for member in members {
            match self.create(fs, member) {
                Ok(id) => created.push(id),
                Err(e) => {
                    for id in created {
                        fs.nexthops.release(id)?;
                    }
                    return Err(e);
                }
            }
        }
        let keys: Vec<_> = created
            .iter()
            .filter_map(|id| fs.nexthops.get(*id).map(|nh| *nh.key()))
            .collect();
        let comp = fs
            .nexthops
            .find_or_create_composite(composite, &keys, &mut fs.resources)?;
        // the composite holds its own references on members
        for id in created {
            fs.nexthops.release(id)?;
        }
        if comp.is_invalid() {
            return Err(AgentError::NextHopExhausted("composite".to_string()));
        }
        self.program(&mut fs.resources, comp);
        self.install_route(fs, vrf, dst, comp);
        Ok(comp)
    }

    pub fn remove_route(&self, vrf: u32, dst: IpAddr) -> Result<bool, AgentError> {
        let Some(nh) = self.routes.remove(vrf, dst) else {
            return Ok(false);
        };
        self.forwarding.lock().nexthops.release(nh)?;
        Ok(true)
    }

    /// The dataplane no longer uses anything depending on `key`.
    pub fn dataplane_ack(&self, key: &ResourceKey) -> usize {
        let cleared = self.forwarding.lock().resources.ack(key, self.dataplane);
        debug!("Dataplane ack for {key}: {cleared} entries released");
        cleared
    }

    /// The dataplane deleted nexthop `nh`.
    pub fn dataplane_ack_nexthop(&self, nh: NextHopId) -> bool {
        self.forwarding
            .lock()
            .resources
            .clear_state(EntryId::NextHop(nh.as_u32()), self.dataplane)
            .is_some()
    }

    /// Finalize what can be finalized.
    pub fn gc(&self) -> GcReport {
        self.forwarding.lock().gc()
    }

    ////////////////////////////////////////////////////////////////////////
    /// Start a resync, e.g. after a restart: every allocated resource is marked stale until
    /// re-claimed. Interfaces and routes are expected to be added again before
    /// [`Agent::end_audit`].
    ////////////////////////////////////////////////////////////////////////
    pub fn begin_audit(&self) {
        info!("Audit started");
        self.forwarding.lock().resources.mark_all_dirty();
    }

    /// Drop what was not re-claimed since [`Agent::begin_audit`]. Returns the number of
    /// interfaces and resources removed.
    pub fn end_audit(&self) -> Result<usize, AgentError> {
        let stale: Vec<u32> = {
            let fs = self.forwarding.lock();
            self.interface_labels
                .lock()
                .iter()
                .filter(|(_, label)| {
                    fs.resources
                        .find(ResourceKind::MplsLabel, **label)
                        .is_some_and(|r| r.dirty)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &stale {
            self.remove_interface(*id)?;
        }
        let owned: Vec<ResourceKey> = self
            .flows
            .entries()
            .iter()
            .filter_map(|e| e.linklocal_binding().map(|b| b.key))
            .collect();
        let mut guard = self.forwarding.lock();
        let fs = &mut *guard;
        // composite slots hold their labels for as long as the composite exists
        let component_labels = fs.nexthops.component_label_keys();
        for key in owned.iter().chain(&component_labels) {
            fs.resources.reclaim(key);
        }
        let flushed = fs.resources.flush_dirty();
        info!(
            "Audit done: {} stale interfaces, {flushed} stale resources",
            stale.len()
        );
        Ok(stale.len() + flushed)
    }

    #[must_use]
    pub fn summary(&self) -> AgentSummary {
        let fs = self.forwarding.lock();
        AgentSummary {
            interfaces: self.scopes.interfaces().len(),
            routes: self.routes.len(),
            nexthops: fs.nexthops.len(),
            labels: fs.resources.in_use(ResourceKind::MplsLabel),
            ports: fs.resources.in_use(ResourceKind::LinkLocalPort),
            flows: self.flows.stats(),
        }
    }
}
