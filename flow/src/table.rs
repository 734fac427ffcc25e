// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The flow table.
//!
//! Entries live in power-of-two many shards selected by a hash of their key. Operations on a
//! pair of entries lock every shard involved (the two keys and their current peers) in
//! ascending shard order. Dataplane requests are collected while shards are locked and sent
//! once they are released. When both are needed, shard locks are taken before the forwarding
//! state lock.

use ahash::RandomState;
use config::{AgentConfig, LinkLocalConfig};
use nexthop::{ForwardingState, NextHopId, SharedForwardingState};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::BuildHasher;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, warn};

use crate::entry::LinkLocalBinding;
use crate::limits::FlowLimits;
use crate::linklocal::{LinkLocalService, LinkLocalServices};
use crate::scope::Scopes;
use crate::{
    ConfigChangeNotifier, DataplaneSync, FlowEntry, FlowFlags, FlowKey, FlowTableError,
    RouteTable, ShortFlowReason,
};

type Shard = HashMap<FlowKey, FlowEntry, RandomState>;

pub(crate) fn hasher_state() -> &'static RandomState {
    static HASHER_STATE: OnceLock<RandomState> = OnceLock::new();
    HASHER_STATE.get_or_init(|| RandomState::with_seeds(0, 0, 0, 0))
}

#[allow(clippy::cast_possible_truncation)] // only the low bits select the shard
fn shard_index(key: &FlowKey, mask: usize) -> usize {
    (hasher_state().hash_one(key) as usize) & mask
}

fn unhold_nexthop(fs: &mut ForwardingState, nh: NextHopId) {
    if let Err(e) = fs.nexthops.release(nh) {
        error!("Flow held a reference on a missing nexthop: {e}");
        debug_assert!(false, "flow reference on missing nexthop {nh}");
    }
}

enum Notify {
    Program(FlowEntry),
    Revoke(FlowKey),
}

/// A set of locked shards.
struct Locked<'a> {
    guards: BTreeMap<usize, MutexGuard<'a, Shard>>,
    mask: usize,
}

impl Locked<'_> {
    fn get(&self, key: &FlowKey) -> Option<&FlowEntry> {
        self.guards.get(&shard_index(key, self.mask))?.get(key)
    }

    fn get_mut(&mut self, key: &FlowKey) -> Option<&mut FlowEntry> {
        self.guards
            .get_mut(&shard_index(key, self.mask))?
            .get_mut(key)
    }

    fn contains(&self, key: &FlowKey) -> bool {
        self.get(key).is_some()
    }

    fn insert(&mut self, entry: FlowEntry) {
        let key = entry.key;
        if let Some(shard) = self.guards.get_mut(&shard_index(&key, self.mask)) {
            shard.insert(key, entry);
        } else {
            error!("insert: shard of {key} is not locked");
            debug_assert!(false, "insert into unlocked shard");
        }
    }

    fn remove(&mut self, key: &FlowKey) -> Option<FlowEntry> {
        self.guards
            .get_mut(&shard_index(key, self.mask))?
            .remove(key)
    }
}

pub struct FlowTable {
    shards: Vec<Mutex<Shard>>,
    mask: usize,
    pub(crate) scopes: Arc<Scopes>,
    pub(crate) limits: FlowLimits,
    pub(crate) forwarding: SharedForwardingState,
    pub(crate) routes: Arc<dyn RouteTable>,
    dataplane: Arc<dyn DataplaneSync>,
    pub(crate) linklocal: LinkLocalServices,
    pub(crate) linklocal_config: LinkLocalConfig,
}

impl FlowTable {
    /// Build a flow table.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured number of shards is not a power of two.
    pub fn new(
        config: &AgentConfig,
        scopes: Arc<Scopes>,
        forwarding: SharedForwardingState,
        routes: Arc<dyn RouteTable>,
        dataplane: Arc<dyn DataplaneSync>,
    ) -> Result<Self, FlowTableError> {
        let num_shards = config.flow.shards;
        if !num_shards.is_power_of_two() {
            return Err(FlowTableError::InvalidShardCount(num_shards));
        }
        debug!("new: flow table with {num_shards} shards");
        Ok(Self {
            shards: (0..num_shards)
                .map(|_| Mutex::new(Shard::with_hasher(hasher_state().clone())))
                .collect(),
            mask: num_shards - 1,
            limits: FlowLimits::new(scopes.clone(), config.flow.max_vm_flows),
            scopes,
            forwarding,
            routes,
            dataplane,
            linklocal: LinkLocalServices::default(),
            linklocal_config: config.linklocal.clone(),
        })
    }

    #[must_use]
    pub fn scopes(&self) -> &Arc<Scopes> {
        &self.scopes
    }

    #[must_use]
    pub fn limits(&self) -> &FlowLimits {
        &self.limits
    }

    #[must_use]
    pub fn linklocal_services(&self) -> &LinkLocalServices {
        &self.linklocal
    }

    #[must_use]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn lock_shard(&self, key: &FlowKey) -> MutexGuard<'_, Shard> {
        let index = shard_index(key, self.mask);
        self.shards[index].lock()
    }

    /// Lock the shards of `keys` and of their current peers, in ascending order.
    fn lock_closure(&self, keys: &[FlowKey]) -> Locked<'_> {
        let mut wanted: BTreeSet<usize> = keys.iter().map(|k| shard_index(k, self.mask)).collect();
        loop {
            let locked = Locked {
                guards: wanted.iter().map(|i| (*i, self.shards[*i].lock())).collect(),
                mask: self.mask,
            };
            let missing: BTreeSet<usize> = keys
                .iter()
                .filter_map(|k| locked.get(k)?.reverse)
                .map(|peer| shard_index(&peer, self.mask))
                .filter(|i| !wanted.contains(i))
                .collect();
            if missing.is_empty() {
                return locked;
            }
            drop(locked);
            wanted.extend(missing);
        }
    }

    fn notify(&self, notes: Vec<Notify>) {
        for note in notes {
            match note {
                Notify::Program(entry) => self.dataplane.program_flow(&entry),
                Notify::Revoke(key) => self.dataplane.revoke_flow(&key),
            }
        }
    }

    pub(crate) fn release_port(&self, binding: LinkLocalBinding) {
        debug!("Releasing link-local port {} ({})", binding.port, binding.key);
        self.forwarding.lock().resources.release_key(&binding.key);
    }

    /// Drop the link-local port of an entry being classified. The port is released right away
    /// unless the stored entry owns it, in which case [`FlowTable::add`] releases it.
    pub(crate) fn drop_port(&self, entry: &mut FlowEntry) {
        let Some(binding) = entry.linklocal.take() else {
            return;
        };
        let stored = self
            .lock_shard(&entry.key)
            .get(&entry.key)
            .and_then(|e| e.linklocal);
        if stored != Some(binding) {
            self.release_port(binding);
        }
    }

    /// Mark an entry short. Short entries never own a link-local port.
    pub(crate) fn shorten(&self, entry: &mut FlowEntry, reason: ShortFlowReason) {
        entry.make_short(reason);
        self.drop_port(entry);
    }

    /// [`FlowTable::shorten`] for an entry of a locked shard.
    fn shorten_stored(&self, entry: &mut FlowEntry, reason: ShortFlowReason) {
        entry.make_short(reason);
        if let Some(binding) = entry.linklocal.take() {
            self.release_port(binding);
        }
    }

    fn charge(&self, entry: &mut FlowEntry) {
        let Some(intf) = entry.data.interface.and_then(|i| self.scopes.interface(i)) else {
            return;
        };
        if !self.limits.admit(&intf) {
            entry.make_short(ShortFlowReason::FlowLimit);
        }
        self.scopes.flow_added(&intf);
        self.limits.refresh(&intf);
    }

    fn uncharge(&self, entry: &FlowEntry) {
        let Some(intf) = entry.data.interface.and_then(|i| self.scopes.interface(i)) else {
            return;
        };
        self.scopes.flow_removed(&intf);
        self.limits.refresh(&intf);
    }

    /// Move the nexthop reference of `old` (if stored) to `entry`. An entry whose nexthop is
    /// gone loses it and becomes ShortFlow(NoDstRoute).
    fn hold_nexthop(&self, entry: &mut FlowEntry, old: Option<&FlowEntry>) {
        let held = old.and_then(|o| o.data.dst_nexthop);
        let wanted = entry.data.dst_nexthop;
        if held == wanted {
            return;
        }
        let mut fs = self.forwarding.lock();
        if let Some(nh) = wanted
            && let Err(e) = fs.nexthops.acquire(nh)
        {
            warn!("Flow {} lost its nexthop: {e}", entry.key);
            entry.data.dst_nexthop = None;
            entry.make_short(ShortFlowReason::NoDstRoute);
        }
        if let Some(nh) = held {
            unhold_nexthop(&mut fs, nh);
        }
    }

    /// Accounting and resource ownership for an entry about to replace `old` (if stored).
    fn settle(&self, entry: &mut FlowEntry, old: Option<&FlowEntry>) {
        self.hold_nexthop(entry, old);
        match old {
            None => self.charge(entry),
            Some(old) if old.data.interface != entry.data.interface => {
                self.uncharge(old);
                self.charge(entry);
            }
            Some(_) => {}
        }
        let dropped = if entry.is_short() {
            entry.linklocal.take()
        } else {
            None
        };
        let stored = old.and_then(|o| o.linklocal);
        if let Some(b) = stored
            && entry.linklocal != Some(b)
        {
            self.release_port(b);
        }
        if let Some(b) = dropped
            && stored != Some(b)
        {
            self.release_port(b);
        }
    }

    /// Get the stored entry for `key`, or a fresh one. Nothing is stored.
    #[must_use]
    pub fn allocate(&self, key: FlowKey) -> FlowEntry {
        self.lock_shard(&key)
            .get(&key)
            .cloned()
            .unwrap_or_else(|| FlowEntry::new(key))
    }

    /// Release what an initialized entry holds if it is not going to be added.
    pub fn discard(&self, mut entry: FlowEntry) {
        self.drop_port(&mut entry);
    }

    #[must_use]
    pub fn find(&self, key: &FlowKey) -> Option<FlowEntry> {
        self.lock_shard(key).get(key).cloned()
    }

    ////////////////////////////////////////////////////////////////////////
    /// Commit a forward entry and its reverse, linking them to each other.
    ///
    /// Entries new to the table are admitted in order, forward first; an entry over the
    /// flow limit of its interface is stored as ShortFlow(FlowLimit). Previous peers of either
    /// entry lose their link. Short entries give their link-local port back.
    ////////////////////////////////////////////////////////////////////////
    pub fn add(&self, mut fwd: FlowEntry, mut rev: FlowEntry) {
        if fwd.key == rev.key {
            fwd.make_short(ShortFlowReason::SameFlowRflowKey);
            fwd.reverse = None;
            self.add_single(fwd);
            return;
        }
        debug!("add: {} <-> {}", fwd.key, rev.key);
        let mut notes = Vec::new();
        {
            let mut locked = self.lock_closure(&[fwd.key, rev.key]);
            let old_fwd_peer = locked.get(&fwd.key).and_then(|e| e.reverse);
            let old_rev_peer = locked.get(&rev.key).and_then(|e| e.reverse);
            if let Some(p) = old_fwd_peer.filter(|p| *p != rev.key)
                && let Some(peer) = locked.get_mut(&p)
            {
                peer.reverse = None;
                self.shorten_stored(peer, ShortFlowReason::NoReverseFlow);
                notes.push(Notify::Program(peer.clone()));
            }
            if let Some(p) = old_rev_peer.filter(|p| *p != fwd.key)
                && let Some(peer) = locked.get_mut(&p)
            {
                peer.reverse = None;
                self.shorten_stored(peer, ShortFlowReason::ReverseFlowChange);
                notes.push(Notify::Program(peer.clone()));
            }

            for entry in [&mut fwd, &mut rev] {
                let old = locked.remove(&entry.key);
                self.settle(entry, old.as_ref());
            }
            fwd.reverse = Some(rev.key);
            rev.reverse = Some(fwd.key);
            fwd.flags.remove(FlowFlags::REVERSE_FLOW);
            rev.flags.insert(FlowFlags::REVERSE_FLOW);

            notes.push(Notify::Program(fwd.clone()));
            notes.push(Notify::Program(rev.clone()));
            locked.insert(fwd);
            locked.insert(rev);
        }
        self.notify(notes);
    }

    fn add_single(&self, mut entry: FlowEntry) {
        debug!("add: {} without reverse", entry.key);
        {
            let mut locked = self.lock_closure(&[entry.key]);
            let old = locked.remove(&entry.key);
            if let Some(p) = old.as_ref().and_then(|o| o.reverse)
                && let Some(peer) = locked.get_mut(&p)
            {
                peer.reverse = None;
            }
            self.settle(&mut entry, old.as_ref());
            locked.insert(entry.clone());
        }
        self.notify(vec![Notify::Program(entry)]);
    }

    /// Remove the entry for `key`. Its peer loses its reverse link, its port is released and
    /// its interface uncharged. With `revoke`, the dataplane is told to remove the flow.
    pub fn delete(&self, key: &FlowKey, revoke: bool) -> bool {
        let mut notes = Vec::new();
        {
            let mut locked = self.lock_closure(&[*key]);
            let Some(entry) = locked.remove(key) else {
                return false;
            };
            if let Some(p) = entry.reverse
                && let Some(peer) = locked.get_mut(&p)
                && peer.reverse == Some(*key)
            {
                peer.reverse = None;
                notes.push(Notify::Program(peer.clone()));
            }
            if let Some(binding) = entry.linklocal {
                self.release_port(binding);
            }
            if let Some(nh) = entry.data.dst_nexthop {
                unhold_nexthop(&mut self.forwarding.lock(), nh);
            }
            self.uncharge(&entry);
        }
        debug!("delete: {key}");
        if revoke {
            notes.push(Notify::Revoke(*key));
        }
        self.notify(notes);
        true
    }

    ////////////////////////////////////////////////////////////////////////
    /// The dataplane slot of `old` now holds `new`.
    ///
    /// `old` loses its reverse link and is marked evicted but stays in the table until it is
    /// deleted. `new` is created and installed if needed, and linked to the former peer of
    /// `old` when it is the opposite direction of that peer; otherwise the peer becomes
    /// ShortFlow(NoReverseFlow).
    ////////////////////////////////////////////////////////////////////////
    pub fn flow_evicted(&self, old: &FlowKey, new: &FlowKey) {
        if old == new {
            return;
        }
        let mut notes = Vec::new();
        {
            let mut locked = self.lock_closure(&[*old, *new]);
            let Some(evicted) = locked.get_mut(old) else {
                debug!("evict: {old} is not in the table");
                return;
            };
            evicted.evicted = true;
            let peer_key = evicted.reverse.take();
            let interface = evicted.data.interface;
            debug!("evict: {old} replaced by {new}");

            if let Some(p) = peer_key
                && let Some(peer) = locked.get_mut(&p)
                && peer.reverse == Some(*old)
            {
                peer.reverse = None;
            }

            let created = !locked.contains(new);
            if created {
                let mut entry = FlowEntry::new(*new);
                entry.data.interface = interface;
                self.charge(&mut entry);
                locked.insert(entry);
            }

            let mut linked = false;
            if let Some(p) = peer_key.filter(|p| locked.contains(p)) {
                let new_is_free = locked.get(new).is_some_and(|e| e.reverse.is_none());
                if new.is_reverse_of(&p) && new_is_free && p != *new {
                    let peer_is_reverse = locked.get(&p).is_some_and(FlowEntry::is_reverse_flow);
                    if let Some(peer) = locked.get_mut(&p) {
                        peer.reverse = Some(*new);
                    }
                    if let Some(entry) = locked.get_mut(new) {
                        entry.reverse = Some(p);
                        entry.flags.set(FlowFlags::REVERSE_FLOW, !peer_is_reverse);
                        notes.push(Notify::Program(entry.clone()));
                        linked = true;
                    }
                } else if let Some(peer) = locked.get_mut(&p) {
                    self.shorten_stored(peer, ShortFlowReason::NoReverseFlow);
                    notes.push(Notify::Program(peer.clone()));
                }
            }
            if created
                && !linked
                && let Some(entry) = locked.get(new)
            {
                notes.push(Notify::Program(entry.clone()));
            }
        }
        self.notify(notes);
    }

    /// Delete every flow, one shard at a time. Returns the number of entries removed.
    pub fn flush(&self) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let keys: Vec<FlowKey> = shard.lock().keys().copied().collect();
            removed += keys.iter().filter(|k| self.delete(k, true)).count();
        }
        debug!("flush: removed {removed} flows");
        removed
    }

    /// Number of entries. A snapshot across shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, sorted by key.
    #[must_use]
    pub fn entries(&self) -> Vec<FlowEntry> {
        let mut entries: Vec<FlowEntry> = self
            .shards
            .iter()
            .flat_map(|s| s.lock().values().cloned().collect::<Vec<_>>())
            .collect();
        entries.sort_by_key(|e| e.key);
        entries
    }

    #[must_use]
    pub fn list_by_vrf(&self, vrf: u32) -> Vec<FlowEntry> {
        let mut entries = self.entries();
        entries.retain(|e| e.key.vrf_id == vrf);
        entries
    }
}

impl ConfigChangeNotifier for FlowTable {
    fn vn_max_flows_changed(&self, vn: u32, max_flows: u32) {
        debug!("VN {vn} max flows now {max_flows}");
        self.scopes.set_vn_max_flows(vn, max_flows);
        for intf in self.scopes.interfaces_in_vn(vn) {
            intf.invalidate_limit();
            self.limits.refresh(&intf);
        }
    }

    fn interface_max_flows_changed(&self, interface: u32, max_flows: u32) {
        let Some(intf) = self.scopes.interface(interface) else {
            debug!("Max flows for unknown interface {interface}");
            return;
        };
        intf.set_max_flows(max_flows);
        self.limits.refresh(&intf);
    }

    fn link_local_service_changed(&self, services: Vec<LinkLocalService>) {
        self.linklocal.replace(&services);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, FABRIC_VRF, Fixture, VRF, config, ip, udp, vhost_ip};
    use crate::{FlowAction, Interface};
    use nexthop::{NextHopVariant, NhState, TunnelEncap};
    use pretty_assertions::assert_eq;

    fn key(src_port: u16, dst_port: u16) -> FlowKey {
        FlowKey::new(
            VRF,
            ip(10, 0, 0, 1),
            ip(10, 0, 0, 200),
            FlowKey::PROTO_UDP,
            src_port,
            dst_port,
            7,
        )
    }

    fn reverse_of(k: &FlowKey) -> FlowKey {
        FlowKey::new(
            k.vrf_id,
            k.dst_ip,
            k.src_ip,
            k.protocol,
            k.dst_port,
            k.src_port,
            9,
        )
    }

    /// Every link is mutual.
    fn assert_symmetric(table: &FlowTable) {
        for entry in table.entries() {
            if let Some(r) = entry.reverse() {
                let peer = table.find(r).unwrap();
                assert_eq!(peer.reverse(), Some(entry.key()), "{entry} / {peer}");
            }
        }
    }

    #[test]
    fn shard_count_must_be_power_of_two() {
        let fx = Fixture::new(&config(2, 3));
        let mut config = config(2, 3);
        config.flow.shards = 3;
        let table = FlowTable::new(
            &config,
            fx.scopes.clone(),
            fx.forwarding.clone(),
            fx.routes.clone(),
            fx.dataplane.clone(),
        );
        assert_eq!(table.err(), Some(FlowTableError::InvalidShardCount(3)));
        assert_eq!(fx.table.num_shards(), 4);
    }

    #[test]
    #[tracing_test::traced_test]
    fn add_links_both_directions() {
        let fx = Fixture::with_defaults();
        let intf = fx.interface(1, 1, 10);
        fx.remote_route(VRF, ip(10, 0, 0, 200));
        let flow = fx
            .table
            .process_new_flow(&udp(&intf, ip(10, 0, 0, 200), 5000, 53));

        let fwd = fx.table.find(&flow.forward).unwrap();
        let rev = fx.table.find(&flow.reverse).unwrap();
        assert_eq!(fwd.reverse(), Some(&flow.reverse));
        assert_eq!(rev.reverse(), Some(&flow.forward));
        assert!(!fwd.is_reverse_flow());
        assert!(rev.is_reverse_flow());
        assert!(!fwd.is_short());
        assert_eq!(fwd.action(), FlowAction::PASS);
        assert_eq!(flow.forward.nexthop_id, intf.flow_key_nexthop().as_u32());
        assert_eq!(rev.key().src_port, 53);
        assert_eq!(rev.key().dst_ip, ip(10, 0, 0, 1));
        assert_eq!(intf.flow_count(), 2);
        assert_eq!(
            fx.dataplane.take(),
            vec![Event::Program(flow.forward), Event::Program(flow.reverse)]
        );
        assert!(logs_contain("add:"));
    }

    #[test]
    fn same_key_is_stored_once() {
        let fx = Fixture::with_defaults();
        let k = key(1000, 1000);
        fx.table.add(FlowEntry::new(k), FlowEntry::new(k));
        assert_eq!(fx.table.len(), 1);
        let entry = fx.table.find(&k).unwrap();
        assert_eq!(entry.short_reason(), Some(ShortFlowReason::SameFlowRflowKey));
        assert!(entry.reverse().is_none());
    }

    #[test]
    fn re_add_unlinks_previous_peers() {
        let fx = Fixture::with_defaults();
        let a = key(1000, 53);
        let b = reverse_of(&a);
        let c = FlowKey { nexthop_id: 11, ..b };
        fx.table.add(FlowEntry::new(a), FlowEntry::new(b));

        // a now pairs with c, b is orphaned
        fx.table.add(fx.table.allocate(a), FlowEntry::new(c));
        let orphan = fx.table.find(&b).unwrap();
        assert!(orphan.reverse().is_none());
        assert_eq!(orphan.short_reason(), Some(ShortFlowReason::NoReverseFlow));
        assert_eq!(fx.table.find(&a).unwrap().reverse(), Some(&c));

        // d takes c as its reverse, a loses it
        let d = FlowKey { nexthop_id: 12, ..a };
        fx.table.add(FlowEntry::new(d), fx.table.allocate(c));
        let a_entry = fx.table.find(&a).unwrap();
        assert!(a_entry.reverse().is_none());
        assert_eq!(
            a_entry.short_reason(),
            Some(ShortFlowReason::ReverseFlowChange)
        );
        assert_eq!(fx.table.find(&c).unwrap().reverse(), Some(&d));
        assert_symmetric(&fx.table);
    }

    #[test]
    fn delete_unlinks_and_revokes() {
        let fx = Fixture::with_defaults();
        let intf = fx.interface(1, 1, 10);
        fx.remote_route(VRF, ip(10, 0, 0, 200));
        let flow = fx
            .table
            .process_new_flow(&udp(&intf, ip(10, 0, 0, 200), 5000, 53));
        fx.dataplane.take();

        assert!(fx.table.delete(&flow.forward, true));
        assert!(!fx.table.delete(&flow.forward, true));
        let rev = fx.table.find(&flow.reverse).unwrap();
        assert!(rev.reverse().is_none());
        assert_eq!(intf.flow_count(), 1);
        assert_eq!(
            fx.dataplane.take(),
            vec![Event::Program(flow.reverse), Event::Revoke(flow.forward)]
        );
    }

    #[test]
    fn eviction_relinks_the_replacement() {
        let fx = Fixture::with_defaults();
        let intf = fx.interface(1, 1, 10);
        fx.remote_route(VRF, ip(10, 0, 0, 200));
        let flow = fx
            .table
            .process_new_flow(&udp(&intf, ip(10, 0, 0, 200), 5000, 53));

        // same tuple, arriving through another nexthop
        let replacement = FlowKey {
            nexthop_id: 99,
            ..flow.forward
        };
        fx.dataplane.take();
        fx.table.flow_evicted(&flow.forward, &replacement);
        assert_eq!(fx.dataplane.take(), vec![Event::Program(replacement)]);

        let evicted = fx.table.find(&flow.forward).unwrap();
        assert!(evicted.is_evicted());
        assert!(evicted.reverse().is_none());
        let new = fx.table.find(&replacement).unwrap();
        assert_eq!(new.reverse(), Some(&flow.reverse));
        assert_eq!(new.interface(), Some(1));
        assert_eq!(
            fx.table.find(&flow.reverse).unwrap().reverse(),
            Some(&replacement)
        );
        assert_eq!(fx.table.len(), 3);
        assert_eq!(intf.flow_count(), 3);
        assert_symmetric(&fx.table);
    }

    #[test]
    fn eviction_by_unrelated_flow_shortens_peer() {
        let fx = Fixture::with_defaults();
        let intf = fx.interface(1, 1, 10);
        fx.remote_route(VRF, ip(10, 0, 0, 200));
        let flow = fx
            .table
            .process_new_flow(&udp(&intf, ip(10, 0, 0, 200), 5000, 53));
        let unrelated = key(7000, 7001);
        fx.dataplane.take();
        fx.table.flow_evicted(&flow.forward, &unrelated);

        let peer = fx.table.find(&flow.reverse).unwrap();
        assert!(peer.reverse().is_none());
        assert_eq!(peer.short_reason(), Some(ShortFlowReason::NoReverseFlow));
        assert!(fx.table.find(&unrelated).unwrap().reverse().is_none());
        assert!(fx.table.find(&flow.forward).is_some());
        // the replacement is installed even though it has no reverse
        assert_eq!(
            fx.dataplane.take(),
            vec![Event::Program(flow.reverse), Event::Program(unrelated)]
        );
    }

    #[test]
    fn flows_hold_their_nexthop() {
        let fx = Fixture::with_defaults();
        let intf = fx.interface(1, 1, 10);
        let dst = ip(10, 0, 0, 200);
        let nh = {
            let mut guard = fx.forwarding.lock();
            let fs = &mut *guard;
            let tunnel = NextHopVariant::Tunnel {
                vrf: FABRIC_VRF,
                src_ip: vhost_ip(),
                dst_ip: ip(192, 168, 0, 2),
                policy: false,
                encap: TunnelEncap::MPLS_GRE,
            };
            fs.nexthops.find_or_create(tunnel, &mut fs.resources)
        };
        fx.routes.add(VRF, dst, nh);
        let flow = fx.table.process_new_flow(&udp(&intf, dst, 5000, 53));
        assert_eq!(fx.table.find(&flow.forward).unwrap().data().dst_nexthop, Some(nh));
        assert_eq!(fx.forwarding.lock().nexthops.get(nh).unwrap().refcount(), 2);

        // withdrawing the route leaves the flow's reference
        fx.routes.remove(VRF, dst);
        fx.forwarding.lock().nexthops.release(nh).unwrap();
        assert_eq!(fx.forwarding.lock().gc().nexthops, 0);
        {
            let mut guard = fx.forwarding.lock();
            let fs = &mut *guard;
            assert_eq!(fs.nexthops.get(nh).unwrap().state(), NhState::Active);
            let other = fs.nexthops.find_or_create(NextHopVariant::Discard, &mut fs.resources);
            assert_ne!(other, nh);
        }

        assert!(fx.table.delete(&flow.forward, true));
        assert_eq!(fx.forwarding.lock().gc().nexthops, 1);
        assert!(fx.forwarding.lock().nexthops.get(nh).is_none());
    }

    #[test]
    fn flush_removes_everything() {
        let fx = Fixture::with_defaults();
        let intf = fx.interface(1, 1, 10);
        fx.remote_route(VRF, ip(10, 0, 0, 200));
        for port in 5000..5010 {
            fx.table
                .process_new_flow(&udp(&intf, ip(10, 0, 0, 200), port, 53));
        }
        assert_eq!(fx.table.len(), 20);
        assert_eq!(fx.table.list_by_vrf(VRF).len(), 20);
        assert!(fx.table.list_by_vrf(VRF + 1).is_empty());
        fx.dataplane.take();

        assert_eq!(fx.table.flush(), 20);
        assert!(fx.table.is_empty());
        assert_eq!(intf.flow_count(), 0);
        let revokes = fx
            .dataplane
            .take()
            .into_iter()
            .filter(|e| matches!(e, Event::Revoke(_)))
            .count();
        assert_eq!(revokes, 20);
    }

    #[test]
    fn config_changes_refresh_limits() {
        let fx = Fixture::with_defaults();
        let intf = fx.interface(1, 1, 10);
        fx.remote_route(VRF, ip(10, 0, 0, 200));
        fx.table
            .process_new_flow(&udp(&intf, ip(10, 0, 0, 200), 5000, 53));
        assert!(!intf.drop_new_flows());

        fx.table.vn_max_flows_changed(10, 2);
        assert_eq!(intf.effective_max_flows(), 2);
        assert!(intf.drop_new_flows());

        fx.table.interface_max_flows_changed(1, 5);
        assert_eq!(intf.effective_max_flows(), 5);
        assert!(!intf.drop_new_flows());

        fx.table.link_local_service_changed(vec![]);
        assert!(fx.table.linklocal_services().is_empty());
    }

    #[test]
    fn links_stay_symmetric() {
        bolero::check!()
            .with_type::<Vec<(u8, u8)>>()
            .for_each(|ops: &Vec<(u8, u8)>| {
                let fx = Fixture::with_defaults();
                let intf = fx.interface(1, 1, 10);
                fx.remote_route(VRF, ip(10, 0, 0, 200));
                let fwd_key = |port: u8| FlowKey {
                    nexthop_id: intf.flow_key_nexthop().as_u32(),
                    ..key(1000 + u16::from(port % 8), 53)
                };
                for (op, port) in ops.iter().take(32) {
                    match op % 4 {
                        0 | 1 => {
                            fx.table.process_new_flow(&udp(
                                &intf,
                                ip(10, 0, 0, 200),
                                1000 + u16::from(port % 8),
                                53,
                            ));
                        }
                        2 => {
                            fx.table.delete(&fwd_key(*port), true);
                        }
                        _ => {
                            let new = FlowKey {
                                nexthop_id: u32::from(*port),
                                ..fwd_key(*port)
                            };
                            fx.table.flow_evicted(&fwd_key(*port), &new);
                        }
                    }
                    assert_symmetric(&fx.table);
                }
                let charged = usize::try_from(intf.flow_count()).unwrap();
                assert_eq!(fx.table.flush(), charged);
                assert_eq!(intf.flow_count(), 0);
            });
    }
}
