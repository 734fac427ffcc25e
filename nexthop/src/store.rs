// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The nexthop store.
//!
//! The store is the single owner of every nexthop. Routes, flows, labels and composites hold
//! [`NextHopId`]s and a reference count in the store; nothing else keeps a pointer to a nexthop.
//! A nexthop whose count drops to zero enters [`NhState::PendingDelete`]: it stays findable and
//! can be renewed by its key until a [`NextHopStore::gc`] pass finds that no dataplane listener
//! holds state on it anymore.

use ahash::RandomState;
use config::NextHopConfig;
use resource::{
    DbState, EntryId, ListenerId, ResourceError, ResourceIndex, ResourceKey, ResourceKind,
    ResourceManager,
};
use roaring::RoaringBitmap;
use std::collections::{BTreeMap, HashMap};
use strum::Display as StrumDisplay;
use tracing::{debug, error, warn};

use crate::{CompositeNh, NextHopError, NextHopKey, NextHopVariant};

pub type NextHopId = id::Id<NextHop>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
pub enum NhState {
    #[strum(serialize = "active")]
    Active,
    #[strum(serialize = "pending-delete")]
    PendingDelete,
}

#[derive(Debug, Clone)]
pub struct NextHop {
    id: NextHopId,
    key: NextHopKey,
    pub(crate) variant: NextHopVariant,
    refcount: u32,
    state: NhState,
}

impl NextHop {
    #[must_use]
    pub fn id(&self) -> NextHopId {
        self.id
    }
    #[must_use]
    pub fn key(&self) -> &NextHopKey {
        &self.key
    }
    #[must_use]
    pub fn variant(&self) -> &NextHopVariant {
        &self.variant
    }
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refcount
    }
    #[must_use]
    pub fn state(&self) -> NhState {
        self.state
    }
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == NhState::Active
    }
    #[must_use]
    pub fn composite(&self) -> Option<&CompositeNh> {
        self.variant.as_composite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LabelBinding {
    nexthop: NextHopId,
    binds: u32,
}

pub struct NextHopStore {
    arena: Vec<Option<NextHop>>,
    free: RoaringBitmap,
    by_key: HashMap<NextHopKey, NextHopId, RandomState>,
    labels: BTreeMap<ResourceIndex, LabelBinding>,
    max: u32,
    listener: ListenerId,
}

impl NextHopStore {
    /// Build an empty store. The store registers itself as a db listener so that labels
    /// depending on a nexthop outlive it until it is finalized.
    pub fn new(config: &NextHopConfig, rm: &mut ResourceManager) -> Self {
        Self {
            arena: Vec::new(),
            free: RoaringBitmap::new(),
            by_key: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
            labels: BTreeMap::new(),
            max: config.max_nexthops,
            listener: rm.register_listener("nexthop-store"),
        }
    }

    #[must_use]
    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn alloc_id(&mut self) -> Option<NextHopId> {
        if let Some(raw) = self.free.min() {
            self.free.remove(raw);
            return Some(NextHopId::new(raw));
        }
        let next = u32::try_from(self.arena.len()).ok()?;
        if next >= self.max {
            return None;
        }
        self.arena.push(None);
        Some(NextHopId::new(next))
    }

    #[must_use]
    pub fn get(&self, id: NextHopId) -> Option<&NextHop> {
        self.arena.get(id.index())?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: NextHopId) -> Option<&mut NextHop> {
        self.arena.get_mut(id.index())?.as_mut()
    }

    /// Look a nexthop up by key without taking a reference.
    #[must_use]
    pub fn find(&self, key: &NextHopKey) -> Option<NextHopId> {
        self.by_key.get(key).copied()
    }

    #[must_use]
    pub fn lookup(&self, key: &NextHopKey) -> Option<&NextHop> {
        self.find(key).and_then(|id| self.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &NextHop> {
        self.arena.iter().flatten()
    }

    ////////////////////////////////////////////////////////////////////////
    /// Get the nexthop with the key of `variant`, creating it if needed, and take a reference
    /// on it.
    ///
    /// On a hit the attributes of `variant` replace the stored ones, and a nexthop pending
    /// deletion is renewed. Composites are created without members; use
    /// [`NextHopStore::rebuild_composite`] to fill them. Returns [`NextHopId::INVALID`] if the
    /// id space is exhausted.
    ////////////////////////////////////////////////////////////////////////
    pub fn find_or_create(
        &mut self,
        variant: NextHopVariant,
        rm: &mut ResourceManager,
    ) -> NextHopId {
        let key = variant.key();
        if let Some(id) = self.find(&key) {
            if let Err(e) = self.acquire(id) {
                error!("Nexthop {key} indexed as {id} but missing: {e}");
                debug_assert!(false, "stale key index for {key}");
                return NextHopId::INVALID;
            }
            if !variant.is_composite()
                && let Err(e) = self.change(id, variant)
            {
                warn!("Could not update nexthop {id}: {e}");
            }
            return id;
        }

        let Some(id) = self.alloc_id() else {
            warn!("Nexthop id space exhausted ({} ids), cannot create {key}", self.max);
            return NextHopId::INVALID;
        };
        let variant = match variant {
            NextHopVariant::Composite(c) => NextHopVariant::Composite(CompositeNh::new(
                c.composite_type,
                c.vrf,
                c.policy,
                c.group,
            )),
            other => other,
        };
        let entry = EntryId::NextHop(id.as_u32());
        if let Err(e) = rm.set_state(entry, self.listener, DbState { handle: id.as_u32() }) {
            error!("Could not attach store state to nexthop {id}: {e}");
        }
        if let Some(slot) = self.arena.get_mut(id.index()) {
            *slot = Some(NextHop {
                id,
                key,
                variant,
                refcount: 1,
                state: NhState::Active,
            });
        }
        self.by_key.insert(key, id);
        debug!("Created nexthop {id}: {key}");
        id
    }

    /// Take a reference on an existing nexthop, renewing it if it was pending deletion.
    pub fn acquire(&mut self, id: NextHopId) -> Result<(), NextHopError> {
        let nh = self.get_mut(id).ok_or(NextHopError::UnknownNextHop(id))?;
        if nh.state == NhState::PendingDelete {
            nh.state = NhState::Active;
            debug!("Renewed nexthop {id}: {}", nh.key);
        }
        nh.refcount += 1;
        Ok(())
    }

    /// Drop a reference. The last one moves the nexthop to [`NhState::PendingDelete`].
    pub fn release(&mut self, id: NextHopId) -> Result<(), NextHopError> {
        let nh = self.get_mut(id).ok_or(NextHopError::UnknownNextHop(id))?;
        if nh.refcount == 0 {
            error!("Release of nexthop {id} ({}) with no reference", nh.key);
            debug_assert!(false, "nexthop {id} released too many times");
            return Ok(());
        }
        nh.refcount -= 1;
        if nh.refcount == 0 {
            nh.state = NhState::PendingDelete;
            debug!("Nexthop {id} ({}) pending deletion", nh.key);
        }
        Ok(())
    }

    /// Update the attributes of nexthop `id`. The key of `variant` must be the one of `id`.
    /// Returns whether anything changed.
    pub fn change(&mut self, id: NextHopId, variant: NextHopVariant) -> Result<bool, NextHopError> {
        let nh = self.get_mut(id).ok_or(NextHopError::UnknownNextHop(id))?;
        let requested = variant.key();
        if requested != nh.key {
            return Err(NextHopError::KeyMismatch {
                id,
                current: nh.key,
                requested,
            });
        }
        if nh.variant.is_composite() {
            return Err(NextHopError::CompositeChange(id));
        }
        if nh.variant == variant {
            return Ok(false);
        }
        debug!("Changed nexthop {id}: {variant:?}");
        nh.variant = variant;
        Ok(true)
    }

    ////////////////////////////////////////////////////////////////////////
    /// Bind the label allocated for `key` to nexthop `nh`.
    ///
    /// The binding holds a reference on the nexthop, and the nexthop becomes a dependent of
    /// the label, so the label is not reissued before the nexthop is gone from the dataplane.
    /// Binding a label to another nexthop moves it. Returns [`ResourceIndex::INVALID`] if no
    /// label is available.
    ////////////////////////////////////////////////////////////////////////
    pub fn bind_label(
        &mut self,
        key: ResourceKey,
        nh: NextHopId,
        rm: &mut ResourceManager,
    ) -> Result<ResourceIndex, NextHopError> {
        if key.kind() != ResourceKind::MplsLabel {
            warn!("Cannot bind {key} to a nexthop: not a label");
            return Ok(ResourceIndex::INVALID);
        }
        if self.get(nh).is_none() {
            return Err(NextHopError::UnknownNextHop(nh));
        }
        let label = rm.allocate(key);
        if label.is_invalid() {
            warn!("No label left for {key}");
            return Ok(label);
        }
        let entry = EntryId::NextHop(nh.as_u32());
        match self.labels.get(&label).copied() {
            Some(binding) if binding.nexthop == nh => {
                self.acquire(nh)?;
                if let Some(b) = self.labels.get_mut(&label) {
                    b.binds += 1;
                }
            }
            Some(binding) => {
                // the label keeps its users, only its target moves
                rm.release(ResourceKind::MplsLabel, label);
                for _ in 0..binding.binds {
                    self.acquire(nh)?;
                    self.release(binding.nexthop)?;
                }
                rm.remove_dependent(
                    ResourceKind::MplsLabel,
                    label,
                    EntryId::NextHop(binding.nexthop.as_u32()),
                );
                rm.add_dependent(ResourceKind::MplsLabel, label, entry)?;
                if let Some(b) = self.labels.get_mut(&label) {
                    b.nexthop = nh;
                }
                debug!("Label {label} moved from nexthop {} to {nh}", binding.nexthop);
            }
            None => {
                self.acquire(nh)?;
                rm.add_dependent(ResourceKind::MplsLabel, label, entry)?;
                self.labels.insert(
                    label,
                    LabelBinding {
                        nexthop: nh,
                        binds: 1,
                    },
                );
                debug!("Label {label} ({key}) bound to nexthop {nh}");
            }
        }
        Ok(label)
    }

    /// Undo one [`bind_label`](Self::bind_label).
    pub fn unbind_label(
        &mut self,
        label: ResourceIndex,
        rm: &mut ResourceManager,
    ) -> Result<(), NextHopError> {
        let binding = self
            .labels
            .get_mut(&label)
            .ok_or(ResourceError::UnknownIndex {
                kind: ResourceKind::MplsLabel,
                index: label.as_u32(),
            })?;
        binding.binds -= 1;
        let nh = binding.nexthop;
        if binding.binds == 0 {
            self.labels.remove(&label);
            debug!("Label {label} unbound from nexthop {nh}");
        }
        rm.release(ResourceKind::MplsLabel, label);
        self.release(nh)
    }

    /// The nexthop a label delivers to.
    #[must_use]
    pub fn label_target(&self, label: ResourceIndex) -> Option<NextHopId> {
        self.labels.get(&label).map(|b| b.nexthop)
    }

    ////////////////////////////////////////////////////////////////////////
    /// Finalize nexthops pending deletion that no listener other than the store holds state on.
    ///
    /// Finalizing a composite releases its members and their labels, which may in turn leave
    /// members pending deletion; the pass repeats until nothing else can be finalized.
    /// Returns the nexthops removed.
    ////////////////////////////////////////////////////////////////////////
    pub fn gc(&mut self, rm: &mut ResourceManager) -> Vec<NextHop> {
        let mut removed = Vec::new();
        loop {
            let ready: Vec<NextHopId> = self
                .iter()
                .filter(|nh| nh.state == NhState::PendingDelete)
                .filter(|nh| {
                    rm.dbstate()
                        .holders(EntryId::NextHop(nh.id.as_u32()))
                        .iter()
                        .all(|l| *l == self.listener)
                })
                .map(NextHop::id)
                .collect();
            if ready.is_empty() {
                break;
            }
            removed.extend(ready.into_iter().filter_map(|id| self.finalize(id, rm)));
        }
        removed
    }

    fn finalize(&mut self, id: NextHopId, rm: &mut ResourceManager) -> Option<NextHop> {
        let nh = self.arena.get_mut(id.index())?.take()?;
        if let Some(composite) = nh.composite() {
            for (_, member) in composite.occupied() {
                if member.label.is_valid() {
                    rm.release(ResourceKind::MplsLabel, member.label);
                }
                if let Err(e) = self.release(member.nexthop) {
                    error!("Composite {id} held a dangling member: {e}");
                }
            }
        }
        rm.clear_state(EntryId::NextHop(id.as_u32()), self.listener);
        self.by_key.remove(&nh.key);
        self.free.insert(id.as_u32());
        debug!("Deleted nexthop {id}: {}", nh.key);
        Some(nh)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use config::{LinkLocalConfig, MplsConfig, NextHopConfigBuilder};
    use pretty_assertions::assert_eq;

    pub(crate) fn setup(max_nexthops: u32) -> (NextHopStore, ResourceManager) {
        let mut rm = ResourceManager::new(&MplsConfig::default(), &LinkLocalConfig::default())
            .unwrap();
        let config = NextHopConfigBuilder::default()
            .max_nexthops(max_nexthops)
            .build()
            .unwrap();
        (NextHopStore::new(&config, &mut rm), rm)
    }

    pub(crate) fn intf(interface: u32) -> NextHopVariant {
        NextHopVariant::Interface {
            interface,
            policy: false,
            oper_up: true,
        }
    }

    #[test]
    fn find_or_create_dedups_by_key() {
        let (mut store, mut rm) = setup(16);
        let a = store.find_or_create(intf(1), &mut rm);
        let b = store.find_or_create(
            NextHopVariant::Interface {
                interface: 1,
                policy: false,
                oper_up: false,
            },
            &mut rm,
        );
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        let nh = store.get(a).unwrap();
        assert_eq!(nh.refcount(), 2);
        // attributes follow the latest request
        assert_eq!(
            nh.variant(),
            &NextHopVariant::Interface {
                interface: 1,
                policy: false,
                oper_up: false
            }
        );
        assert_ne!(store.find_or_create(intf(2), &mut rm), a);
    }

    #[test]
    #[tracing_test::traced_test]
    fn delete_on_zero_and_renewal() {
        let (mut store, mut rm) = setup(16);
        let id = store.find_or_create(NextHopVariant::Discard, &mut rm);
        store.release(id).unwrap();
        assert_eq!(store.get(id).unwrap().state(), NhState::PendingDelete);
        // renewal keeps the id
        assert_eq!(store.find_or_create(NextHopVariant::Discard, &mut rm), id);
        assert!(store.get(id).unwrap().is_active());
        assert!(logs_contain("Renewed nexthop"));

        store.release(id).unwrap();
        let removed = store.gc(&mut rm);
        assert_eq!(removed.len(), 1);
        assert!(store.get(id).is_none());
        assert!(store.find(&NextHopKey::Discard).is_none());
        assert!(rm.dbstate().is_empty());
        assert_eq!(
            store.release(id),
            Err(NextHopError::UnknownNextHop(id))
        );
    }

    #[test]
    fn dataplane_state_delays_deletion() {
        let (mut store, mut rm) = setup(16);
        let ksync = rm.register_listener("ksync");
        let id = store.find_or_create(
            NextHopVariant::Vrf {
                vrf: 3,
                flood_unknown_unicast: false,
            },
            &mut rm,
        );
        rm.set_state(EntryId::NextHop(id.as_u32()), ksync, DbState { handle: 1 })
            .unwrap();
        store.release(id).unwrap();
        assert!(store.gc(&mut rm).is_empty());
        rm.clear_state(EntryId::NextHop(id.as_u32()), ksync);
        assert_eq!(store.gc(&mut rm).len(), 1);
    }

    #[test]
    fn id_space_exhaustion() {
        let (mut store, mut rm) = setup(2);
        assert!(store.find_or_create(intf(1), &mut rm).is_valid());
        let b = store.find_or_create(intf(2), &mut rm);
        assert!(b.is_valid());
        assert!(store.find_or_create(intf(3), &mut rm).is_invalid());
        store.release(b).unwrap();
        store.gc(&mut rm);
        assert_eq!(store.find_or_create(intf(3), &mut rm), b);
    }

    #[test]
    fn change_requires_same_key() {
        let (mut store, mut rm) = setup(16);
        let id = store.find_or_create(intf(1), &mut rm);
        assert_eq!(
            store.change(
                id,
                NextHopVariant::Interface {
                    interface: 1,
                    policy: false,
                    oper_up: false
                }
            ),
            Ok(true)
        );
        assert_eq!(store.change(id, intf(1)), Ok(true));
        assert_eq!(store.change(id, intf(1)), Ok(false));
        assert!(matches!(
            store.change(id, intf(2)),
            Err(NextHopError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn label_binding_delays_label_reuse() {
        let (mut store, mut rm) = setup(16);
        let ksync = rm.register_listener("ksync");
        let vrf_nh = store.find_or_create(
            NextHopVariant::Vrf {
                vrf: 5,
                flood_unknown_unicast: true,
            },
            &mut rm,
        );
        let entry = EntryId::NextHop(vrf_nh.as_u32());
        rm.set_state(entry, ksync, DbState { handle: 9 }).unwrap();

        let key = ResourceKey::VrfLabel { vrf: 5 };
        let label = store.bind_label(key, vrf_nh, &mut rm).unwrap();
        assert_eq!(store.label_target(label), Some(vrf_nh));
        assert_eq!(store.get(vrf_nh).unwrap().refcount(), 2);

        store.unbind_label(label, &mut rm).unwrap();
        store.release(vrf_nh).unwrap();
        assert!(store.gc(&mut rm).is_empty());
        assert!(rm.gc().is_empty());
        assert!(rm.find_mpls_label(label).is_some());
        assert_ne!(rm.allocate(ResourceKey::VrfLabel { vrf: 6 }), label);

        rm.clear_state(entry, ksync);
        assert_eq!(store.gc(&mut rm).len(), 1);
        assert_eq!(rm.gc(), vec![(ResourceKind::MplsLabel, label)]);
    }

    #[test]
    fn label_moves_between_nexthops() {
        let (mut store, mut rm) = setup(16);
        let a = store.find_or_create(intf(1), &mut rm);
        let b = store.find_or_create(intf(2), &mut rm);
        let key = ResourceKey::InterfaceLabel {
            interface: 1,
            policy: false,
        };
        let label = store.bind_label(key, a, &mut rm).unwrap();
        assert_eq!(store.bind_label(key, b, &mut rm).unwrap(), label);
        assert_eq!(store.label_target(label), Some(b));
        assert_eq!(store.get(a).unwrap().refcount(), 1);
        assert_eq!(store.get(b).unwrap().refcount(), 2);
        assert_eq!(rm.find_mpls_label(label).unwrap().users(), 1);
    }
}
