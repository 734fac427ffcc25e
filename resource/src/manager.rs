// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The resource manager

use ahash::RandomState;
use config::{LinkLocalConfig, MplsConfig};
use id::Id;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use strum::IntoEnumIterator;
use tracing::{debug, error, info, warn};

use crate::dbstate::{DbState, DbStateTable, EntryId, ListenerId};
use crate::key::{ResourceKey, ResourceKind};
use crate::pool::IndexPool;
use crate::ResourceError;

/// Index of an allocated resource. [`ResourceIndex::INVALID`] signals exhaustion.
pub type ResourceIndex = Id<IndexResource>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    InUse,
    /// Released by its last user, waiting for dependents to be torn down.
    StagedRelease,
}

#[derive(Debug, Clone)]
pub struct IndexResource {
    pub kind: ResourceKind,
    pub index: ResourceIndex,
    pub key: ResourceKey,
    /// Set when the key was touched outside the manager (e.g. state restored after a restart)
    /// and not claimed again since.
    pub dirty: bool,
    pub state: ResourceState,
    users: u32,
    dependents: BTreeSet<EntryId>,
}

impl IndexResource {
    #[must_use]
    pub fn users(&self) -> u32 {
        self.users
    }
    #[must_use]
    pub fn dependents(&self) -> &BTreeSet<EntryId> {
        &self.dependents
    }
    #[must_use]
    pub fn is_staged(&self) -> bool {
        self.state == ResourceState::StagedRelease
    }
}

#[derive(Debug)]
struct Space {
    pool: IndexPool,
    resources: BTreeMap<u32, IndexResource>,
}

impl Space {
    fn new(pool: IndexPool) -> Self {
        Self {
            pool,
            resources: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LinkLocalLimits {
    system: u32,
    per_vm: u32,
}

pub struct ResourceManager {
    labels: Space,
    ports: Space,
    keys: HashMap<ResourceKey, ResourceIndex, RandomState>,
    dbstate: DbStateTable<DbState>,
    ll_limits: LinkLocalLimits,
    ll_in_use: u32,
    ll_per_vm: HashMap<u32, u32, RandomState>,
}

impl ResourceManager {
    pub fn new(mpls: &MplsConfig, linklocal: &LinkLocalConfig) -> Result<Self, ResourceError> {
        let last_label = mpls
            .label_start
            .checked_add(mpls.label_count.saturating_sub(1))
            .filter(|_| mpls.label_count > 0)
            .ok_or(ResourceError::EmptySpace(ResourceKind::MplsLabel))?;
        let labels = IndexPool::new(mpls.label_start..=last_label, []);

        let range = linklocal.port_range;
        if range.is_empty() {
            return Err(ResourceError::EmptySpace(ResourceKind::LinkLocalPort));
        }
        let ports = IndexPool::new(
            u32::from(range.start)..=u32::from(range.end),
            linklocal.reserved_ports.iter().map(|p| u32::from(*p)),
        );
        if ports.capacity() == 0 {
            return Err(ResourceError::EmptySpace(ResourceKind::LinkLocalPort));
        }
        info!(
            "Resource manager: labels {}..={last_label}, link-local ports {}..={} ({} usable)",
            mpls.label_start,
            range.start,
            range.end,
            ports.capacity()
        );
        Ok(Self {
            labels: Space::new(labels),
            ports: Space::new(ports),
            keys: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
            dbstate: DbStateTable::new(),
            ll_limits: LinkLocalLimits {
                system: linklocal.system_flows,
                per_vm: linklocal.vm_flows,
            },
            ll_in_use: 0,
            ll_per_vm: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
        })
    }

    fn space(&self, kind: ResourceKind) -> &Space {
        match kind {
            ResourceKind::MplsLabel => &self.labels,
            ResourceKind::LinkLocalPort => &self.ports,
        }
    }

    fn space_mut(&mut self, kind: ResourceKind) -> &mut Space {
        match kind {
            ResourceKind::MplsLabel => &mut self.labels,
            ResourceKind::LinkLocalPort => &mut self.ports,
        }
    }

    fn linklocal_vm(key: &ResourceKey) -> Option<u32> {
        match key {
            ResourceKey::LinkLocalPort(k) => Some(k.vm),
            _ => None,
        }
    }

    fn linklocal_admit(&self, vm: u32) -> bool {
        if self.ll_in_use >= self.ll_limits.system {
            debug!(
                "Link-local system ceiling reached ({}/{})",
                self.ll_in_use, self.ll_limits.system
            );
            return false;
        }
        let vm_count = self.ll_per_vm.get(&vm).copied().unwrap_or(0);
        if vm_count >= self.ll_limits.per_vm {
            debug!(
                "Link-local ceiling reached for vm {vm} ({vm_count}/{})",
                self.ll_limits.per_vm
            );
            return false;
        }
        true
    }

    fn linklocal_acquire(&mut self, vm: u32) {
        self.ll_in_use += 1;
        *self.ll_per_vm.entry(vm).or_insert(0) += 1;
    }

    fn linklocal_drop(&mut self, vm: u32) {
        self.ll_in_use = self.ll_in_use.saturating_sub(1);
        if let Some(count) = self.ll_per_vm.get_mut(&vm) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ll_per_vm.remove(&vm);
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    /// Allocate (or re-claim) the index for `key`.
    ///
    /// A key that is already allocated yields the same index, gains a user and has its dirty
    /// flag cleared. A key whose index is staged for release is revived with the same index.
    /// Returns [`ResourceIndex::INVALID`] if the space is exhausted or, for link-local ports,
    /// if the per-VM or system ceiling is reached.
    ////////////////////////////////////////////////////////////////////////
    pub fn allocate(&mut self, key: ResourceKey) -> ResourceIndex {
        let kind = key.kind();
        let vm = Self::linklocal_vm(&key);

        if let Some(index) = self.keys.get(&key).copied() {
            let revive = {
                let Some(res) = self.space(kind).resources.get(&index.as_u32()) else {
                    error!("Key {key} maps to {kind} {index} which is not allocated");
                    debug_assert!(false, "dangling key {key}");
                    return ResourceIndex::INVALID;
                };
                res.is_staged()
            };
            if revive && let Some(vm) = vm {
                if !self.linklocal_admit(vm) {
                    return ResourceIndex::INVALID;
                }
                self.linklocal_acquire(vm);
            }
            if let Some(res) = self.space_mut(kind).resources.get_mut(&index.as_u32()) {
                res.dirty = false;
                if revive {
                    res.state = ResourceState::InUse;
                    res.users = 1;
                    debug!("Revived staged {kind} {index} for {key}");
                } else {
                    res.users += 1;
                }
            }
            return index;
        }

        if let Some(vm) = vm
            && !self.linklocal_admit(vm)
        {
            return ResourceIndex::INVALID;
        }
        let space = self.space_mut(kind);
        let Some(raw) = space.pool.take() else {
            warn!("No free {kind} left for {key}");
            return ResourceIndex::INVALID;
        };
        let index = ResourceIndex::new(raw);
        let previous = space.resources.insert(
            raw,
            IndexResource {
                kind,
                index,
                key,
                dirty: false,
                state: ResourceState::InUse,
                users: 1,
                dependents: BTreeSet::new(),
            },
        );
        if let Some(previous) = previous {
            error!("Free {kind} {index} was still held by {}", previous.key);
            debug_assert!(false, "{kind} {index} allocated twice");
        }
        self.keys.insert(key, index);
        if let Some(vm) = vm {
            self.linklocal_acquire(vm);
        }
        debug!("Allocated {kind} {index} for {key}");
        index
    }

    /// Drop one user of `index`. The last release stages the index; it becomes reusable only
    /// after a [`gc`](Self::gc) pass finds no dependent still held by a listener.
    pub fn release(&mut self, kind: ResourceKind, index: ResourceIndex) {
        let Some(res) = self.space_mut(kind).resources.get_mut(&index.as_u32()) else {
            error!("Release of {kind} {index} which is not allocated");
            debug_assert!(false, "release of unallocated {kind} {index}");
            return;
        };
        if res.is_staged() {
            error!("Release of {kind} {index} which is already staged");
            debug_assert!(false, "double release of {kind} {index}");
            return;
        }
        res.users -= 1;
        if res.users > 0 {
            return;
        }
        res.state = ResourceState::StagedRelease;
        let key = res.key;
        debug!("Staged release of {kind} {index} ({key})");
        if let Some(vm) = Self::linklocal_vm(&key) {
            self.linklocal_drop(vm);
        }
    }

    /// Release by key. Unknown keys are ignored.
    pub fn release_key(&mut self, key: &ResourceKey) {
        if let Some(index) = self.keys.get(key).copied() {
            self.release(key.kind(), index);
        }
    }

    #[must_use]
    pub fn find(&self, kind: ResourceKind, index: ResourceIndex) -> Option<&IndexResource> {
        self.space(kind).resources.get(&index.as_u32())
    }

    #[must_use]
    pub fn find_mpls_label(&self, label: ResourceIndex) -> Option<&IndexResource> {
        self.find(ResourceKind::MplsLabel, label)
    }

    #[must_use]
    pub fn find_key(&self, key: &ResourceKey) -> Option<&IndexResource> {
        let index = self.keys.get(key)?;
        self.find(key.kind(), *index)
    }

    #[must_use]
    pub fn is_reserved(&self, kind: ResourceKind, index: u32) -> bool {
        self.space(kind).pool.is_reserved(index)
    }

    /// Whether `index` may be handed out by the next allocation.
    #[must_use]
    pub fn is_free(&self, kind: ResourceKind, index: u32) -> bool {
        self.space(kind).pool.is_free(index)
    }

    /// Record that db entry `entry` structurally depends on `index`.
    pub fn add_dependent(
        &mut self,
        kind: ResourceKind,
        index: ResourceIndex,
        entry: EntryId,
    ) -> Result<(), ResourceError> {
        let res = self
            .space_mut(kind)
            .resources
            .get_mut(&index.as_u32())
            .ok_or(ResourceError::UnknownIndex {
                kind,
                index: index.as_u32(),
            })?;
        res.dependents.insert(entry);
        Ok(())
    }

    pub fn remove_dependent(&mut self, kind: ResourceKind, index: ResourceIndex, entry: EntryId) {
        if let Some(res) = self.space_mut(kind).resources.get_mut(&index.as_u32()) {
            res.dependents.remove(&entry);
        }
    }

    pub fn register_listener(&mut self, name: &str) -> ListenerId {
        self.dbstate.register(name)
    }

    pub fn unregister_listener(&mut self, listener: ListenerId) -> Result<usize, ResourceError> {
        self.dbstate.unregister(listener)
    }

    pub fn set_state(
        &mut self,
        entry: EntryId,
        listener: ListenerId,
        state: DbState,
    ) -> Result<(), ResourceError> {
        self.dbstate.set(entry, listener, state).map(|_| ())
    }

    pub fn clear_state(&mut self, entry: EntryId, listener: ListenerId) -> Option<DbState> {
        self.dbstate.clear(entry, listener)
    }

    #[must_use]
    pub fn dbstate(&self) -> &DbStateTable<DbState> {
        &self.dbstate
    }

    /// The listener acknowledges that it no longer holds anything for the dependents of `key`.
    /// Returns the number of states cleared.
    pub fn ack(&mut self, key: &ResourceKey, listener: ListenerId) -> usize {
        let Some(res) = self.find_key(key) else {
            debug!("Ack for unknown resource {key}");
            return 0;
        };
        let dependents: Vec<EntryId> = res.dependents.iter().copied().collect();
        dependents
            .into_iter()
            .filter(|entry| self.dbstate.clear(*entry, listener).is_some())
            .count()
    }

    ////////////////////////////////////////////////////////////////////////
    /// Finalize staged releases whose dependents are all torn down.
    ///
    /// Returns the indices that went back to their pools. Indices still blocked stay staged and
    /// are retried on the next pass.
    ////////////////////////////////////////////////////////////////////////
    pub fn gc(&mut self) -> Vec<(ResourceKind, ResourceIndex)> {
        let mut freed = Vec::new();
        for kind in ResourceKind::iter() {
            let ready: Vec<u32> = self
                .space(kind)
                .resources
                .iter()
                .filter(|(_, res)| res.is_staged())
                .filter(|(_, res)| res.dependents.iter().all(|e| !self.dbstate.has_state(*e)))
                .map(|(raw, _)| *raw)
                .collect();

            for raw in ready {
                let space = self.space_mut(kind);
                let Some(res) = space.resources.remove(&raw) else {
                    continue;
                };
                if !space.pool.give(raw) {
                    error!("Could not return {kind} {raw} to its pool");
                    debug_assert!(false, "{kind} {raw} not returnable");
                }
                self.keys.remove(&res.key);
                debug!("Freed {kind} {raw} ({})", res.key);
                freed.push((kind, res.index));
            }
        }
        freed
    }

    /// Mark every allocated key dirty, e.g. before replaying state after a restart.
    pub fn mark_all_dirty(&mut self) {
        for kind in ResourceKind::iter() {
            self.space_mut(kind)
                .resources
                .values_mut()
                .filter(|r| !r.is_staged())
                .for_each(|r| r.dirty = true);
        }
    }

    pub fn mark_dirty(&mut self, key: &ResourceKey) {
        let Some(index) = self.keys.get(key).copied() else {
            return;
        };
        if let Some(res) = self.space_mut(key.kind()).resources.get_mut(&index.as_u32()) {
            res.dirty = true;
        }
    }

    /// Clear the dirty flag of a key that is still in use, without taking a user.
    /// Returns false if the key is not allocated.
    pub fn reclaim(&mut self, key: &ResourceKey) -> bool {
        let Some(index) = self.keys.get(key).copied() else {
            return false;
        };
        match self.space_mut(key.kind()).resources.get_mut(&index.as_u32()) {
            Some(res) => {
                res.dirty = false;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn dirty_keys(&self) -> Vec<ResourceKey> {
        ResourceKind::iter()
            .flat_map(|kind| self.space(kind).resources.values())
            .filter(|r| r.dirty && !r.is_staged())
            .map(|r| r.key)
            .collect()
    }

    /// Release every resource not re-claimed since [`mark_all_dirty`](Self::mark_all_dirty).
    pub fn flush_dirty(&mut self) -> usize {
        let stale = self.dirty_keys();
        for key in &stale {
            let kind = key.kind();
            let Some(index) = self.keys.get(key).copied() else {
                continue;
            };
            if let Some(res) = self.space_mut(kind).resources.get_mut(&index.as_u32()) {
                res.dirty = false;
                res.users = 1;
            }
            self.release(kind, index);
        }
        if !stale.is_empty() {
            info!("Flushed {} stale resources", stale.len());
        }
        stale.len()
    }

    #[must_use]
    pub fn list(&self, kind: ResourceKind) -> Vec<&IndexResource> {
        self.space(kind).resources.values().collect()
    }

    #[must_use]
    pub fn in_use(&self, kind: ResourceKind) -> usize {
        self.space(kind)
            .resources
            .values()
            .filter(|r| !r.is_staged())
            .count()
    }

    #[must_use]
    pub fn free_count(&self, kind: ResourceKind) -> u64 {
        self.space(kind).pool.free_count()
    }

    #[must_use]
    pub fn linklocal_in_use(&self) -> u32 {
        self.ll_in_use
    }

    #[must_use]
    pub fn linklocal_in_use_by_vm(&self, vm: u32) -> u32 {
        self.ll_per_vm.get(&vm).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LinkLocalPortKey;
    use config::{LinkLocalConfigBuilder, MplsConfigBuilder, PortRange};
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr};

    fn manager(labels: u32, system: u32, per_vm: u32) -> ResourceManager {
        let mpls = MplsConfigBuilder::default()
            .label_count(labels)
            .build()
            .unwrap();
        let ll = LinkLocalConfigBuilder::default()
            .system_flows(system)
            .vm_flows(per_vm)
            .port_range(PortRange::new(4786, 4792))
            .build()
            .unwrap();
        ResourceManager::new(&mpls, &ll).unwrap()
    }

    fn ll_key(vm: u32, src_port: u16) -> ResourceKey {
        ResourceKey::LinkLocalPort(LinkLocalPortKey {
            vm,
            vrf: 1,
            protocol: 6,
            src_ip: IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + vm)),
            src_port,
            dst_ip: IpAddr::V4(Ipv4Addr::new(169, 254, 1, 10)),
            dst_port: 4000,
        })
    }

    #[test]
    fn allocate_is_idempotent_and_clears_dirty() {
        bolero::check!()
            .with_type()
            .for_each(|(vrf, member): &(u32, u32)| {
                let mut rm = manager(64, 4, 2);
                let key = ResourceKey::ComponentLabel {
                    composite: *vrf,
                    member: *member,
                };
                let first = rm.allocate(key);
                rm.mark_dirty(&key);
                assert_eq!(rm.dirty_keys(), vec![key]);
                let second = rm.allocate(key);
                assert_eq!(first, second);
                assert!(!rm.find_key(&key).unwrap().dirty);
                assert_eq!(rm.find_key(&key).unwrap().users(), 2);
            });
    }

    #[test]
    fn release_is_ref_counted_and_staged() {
        let mut rm = manager(64, 4, 2);
        let key = ResourceKey::VrfLabel { vrf: 1 };
        let label = rm.allocate(key);
        assert_eq!(rm.allocate(key), label);
        rm.release(ResourceKind::MplsLabel, label);
        assert_eq!(rm.find_mpls_label(label).unwrap().state, ResourceState::InUse);
        rm.release(ResourceKind::MplsLabel, label);
        assert!(rm.find_mpls_label(label).unwrap().is_staged());
        assert!(!rm.is_free(ResourceKind::MplsLabel, label.as_u32()));

        let other = rm.allocate(ResourceKey::VrfLabel { vrf: 2 });
        assert_ne!(other, label);

        assert_eq!(rm.gc(), vec![(ResourceKind::MplsLabel, label)]);
        assert!(rm.find_mpls_label(label).is_none());
        assert_eq!(rm.allocate(ResourceKey::VrfLabel { vrf: 3 }), label);
    }

    #[test]
    fn staged_label_is_revived_by_its_key() {
        let mut rm = manager(64, 4, 2);
        let key = ResourceKey::InterfaceLabel {
            interface: 9,
            policy: true,
        };
        let label = rm.allocate(key);
        rm.release_key(&key);
        assert_eq!(rm.allocate(key), label);
        assert!(rm.gc().is_empty());
        assert_eq!(rm.find_key(&key).unwrap().state, ResourceState::InUse);
    }

    #[test]
    #[tracing_test::traced_test]
    fn no_reuse_while_dependent_alive() {
        let mut rm = manager(64, 4, 2);
        let ksync = rm.register_listener("ksync");
        let vrf_nh = EntryId::NextHop(12);
        let key = ResourceKey::VrfLabel { vrf: 5 };
        let label = rm.allocate(key);
        rm.add_dependent(ResourceKind::MplsLabel, label, vrf_nh).unwrap();
        rm.set_state(vrf_nh, ksync, DbState { handle: 12 }).unwrap();

        rm.release(ResourceKind::MplsLabel, label);
        // still findable and valid while the dependent is alive
        let found = rm.find_mpls_label(label).unwrap();
        assert_eq!(found.key, key);
        assert!(found.is_staged());

        for vrf in 100..110 {
            assert!(rm.gc().is_empty());
            assert_ne!(rm.allocate(ResourceKey::VrfLabel { vrf }), label);
        }

        assert_eq!(rm.ack(&key, ksync), 1);
        assert_eq!(rm.gc(), vec![(ResourceKind::MplsLabel, label)]);
        assert!(logs_contain("Freed mpls-label"));
    }

    #[test]
    fn unregistered_listener_releases_its_hold() {
        let mut rm = manager(64, 4, 2);
        let ksync = rm.register_listener("ksync");
        let nh = EntryId::NextHop(3);
        let label = rm.allocate(ResourceKey::VrfLabel { vrf: 7 });
        rm.add_dependent(ResourceKind::MplsLabel, label, nh).unwrap();
        rm.set_state(nh, ksync, DbState { handle: 3 }).unwrap();
        rm.release(ResourceKind::MplsLabel, label);
        assert!(rm.gc().is_empty());

        assert_eq!(rm.unregister_listener(ksync), Ok(1));
        assert_eq!(rm.gc(), vec![(ResourceKind::MplsLabel, label)]);
        assert_eq!(
            rm.unregister_listener(ksync),
            Err(ResourceError::UnknownListener(ksync))
        );
    }

    #[test]
    fn exhaustion_returns_invalid() {
        let mut rm = manager(2, 4, 2);
        assert!(rm.allocate(ResourceKey::VrfLabel { vrf: 1 }).is_valid());
        assert!(rm.allocate(ResourceKey::VrfLabel { vrf: 2 }).is_valid());
        assert_eq!(
            rm.allocate(ResourceKey::VrfLabel { vrf: 3 }),
            ResourceIndex::INVALID
        );
        assert_eq!(rm.free_count(ResourceKind::MplsLabel), 0);
    }

    #[test]
    fn link_local_ports_skip_reserved_and_respect_ceilings() {
        // ports 4786..=4792 minus the reserved 4789
        let mut rm = manager(16, 3, 2);
        let a = rm.allocate(ll_key(1, 3000));
        let b = rm.allocate(ll_key(1, 3001));
        assert_eq!((a.as_u32(), b.as_u32()), (4786, 4787));
        // per-vm ceiling
        assert!(rm.allocate(ll_key(1, 3002)).is_invalid());
        assert_eq!(rm.linklocal_in_use_by_vm(1), 2);

        let c = rm.allocate(ll_key(2, 3000));
        assert_eq!(c.as_u32(), 4788);
        // system ceiling
        assert!(rm.allocate(ll_key(2, 3001)).is_invalid());
        assert_eq!(rm.linklocal_in_use(), 3);

        rm.release(ResourceKind::LinkLocalPort, b);
        assert_eq!(rm.linklocal_in_use_by_vm(1), 1);
        let d = rm.allocate(ll_key(2, 3001));
        assert_eq!(d.as_u32(), 4790);
        assert!(rm.is_reserved(ResourceKind::LinkLocalPort, 4789));
        assert!(
            rm.list(ResourceKind::LinkLocalPort)
                .iter()
                .all(|r| r.index.as_u32() != 4789)
        );
    }

    #[test]
    fn flush_dirty_releases_unclaimed() {
        let mut rm = manager(16, 4, 2);
        let kept = ResourceKey::VrfLabel { vrf: 1 };
        let stale = ResourceKey::VrfLabel { vrf: 2 };
        rm.allocate(kept);
        let stale_label = rm.allocate(stale);
        rm.allocate(stale);

        rm.mark_all_dirty();
        rm.allocate(kept);
        assert_eq!(rm.dirty_keys(), vec![stale]);
        assert_eq!(rm.flush_dirty(), 1);
        assert!(rm.find_key(&stale).unwrap().is_staged());
        assert_eq!(rm.gc(), vec![(ResourceKind::MplsLabel, stale_label)]);
        assert_eq!(rm.in_use(ResourceKind::MplsLabel), 1);
    }
}
