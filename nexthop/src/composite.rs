// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Composite (and ECMP) member computation.
//!
//! Member slots are positional: flows record the slot they were hashed to, so an update never
//! moves a surviving member. Members that go away leave a `None` hole that later additions may
//! fill, though never in the same pass that emptied it.

use ahash::RandomState;
use resource::{EntryId, ResourceIndex, ResourceKey, ResourceKind, ResourceManager};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, error, warn};

use crate::{ComponentNh, NextHopError, NextHopId, NextHopKey, NextHopStore};

/// Outcome of a composite rebuild, in slot indices.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompositeDiff {
    pub kept: Vec<usize>,
    pub removed: Vec<usize>,
    pub added: Vec<usize>,
    /// Desired members that do not exist in the store or could not get a label.
    pub unresolved: Vec<NextHopKey>,
}

impl CompositeDiff {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

impl NextHopStore {
    fn resolve_members(
        &self,
        composite: NextHopId,
        desired: &[NextHopKey],
        diff: &mut CompositeDiff,
    ) -> Vec<NextHopId> {
        let mut seen = HashSet::with_hasher(RandomState::with_seeds(0, 0, 0, 0));
        let mut resolved = Vec::with_capacity(desired.len());
        for key in desired {
            if !seen.insert(*key) {
                continue;
            }
            match self.find(key) {
                Some(id) if id == composite => {
                    error!("Composite {composite} cannot be a member of itself");
                    diff.unresolved.push(*key);
                }
                Some(id) => resolved.push(id),
                None => {
                    debug!("Member {key} of composite {composite} is not resolved yet");
                    diff.unresolved.push(*key);
                }
            }
        }
        resolved
    }

    ////////////////////////////////////////////////////////////////////////
    /// Recompute the members of composite `id` from the `desired` member keys.
    ///
    /// Existing members that are still desired keep their slot and re-claim their label. Other
    /// existing members are cleared and release their label, which the composite no longer
    /// depends on. Remaining desired members go to the first hole left
    /// by an earlier rebuild, or are appended. Every new member takes a reference on its
    /// nexthop and a label of its own. Desired keys not present in the store are skipped.
    ////////////////////////////////////////////////////////////////////////
    pub fn rebuild_composite(
        &mut self,
        id: NextHopId,
        desired: &[NextHopKey],
        rm: &mut ResourceManager,
    ) -> Result<CompositeDiff, NextHopError> {
        let nh = self.get(id).ok_or(NextHopError::UnknownNextHop(id))?;
        if !nh.is_active() {
            return Err(NextHopError::PendingDelete(id));
        }
        let mut members = nh
            .composite()
            .ok_or(NextHopError::NotComposite(id))?
            .members
            .clone();

        let mut diff = CompositeDiff::default();
        let wanted = self.resolve_members(id, desired, &mut diff);

        // keep or clear what is there
        let mut placed = BTreeSet::new();
        let mut cleared = BTreeSet::new();
        for (slot, member) in members.iter_mut().enumerate() {
            let Some(current) = *member else {
                continue;
            };
            if wanted.contains(&current.nexthop) {
                // a kept member still uses its label, also across an audit
                rm.reclaim(&ResourceKey::ComponentLabel {
                    composite: id.as_u32(),
                    member: current.nexthop.as_u32(),
                });
                placed.insert(current.nexthop);
                diff.kept.push(slot);
                continue;
            }
            if current.label.is_valid() {
                rm.remove_dependent(
                    ResourceKind::MplsLabel,
                    current.label,
                    EntryId::NextHop(id.as_u32()),
                );
                rm.release(ResourceKind::MplsLabel, current.label);
            }
            self.release(current.nexthop)?;
            *member = None;
            cleared.insert(slot);
            diff.removed.push(slot);
        }

        // fill older holes first-fit, then append
        for member in wanted.into_iter().filter(|m| !placed.contains(m)) {
            let label = rm.allocate(ResourceKey::ComponentLabel {
                composite: id.as_u32(),
                member: member.as_u32(),
            });
            if label.is_invalid() {
                warn!("No label for member {member} of composite {id}, skipping it");
                if let Some(key) = self.get(member).map(|m| *m.key()) {
                    diff.unresolved.push(key);
                }
                continue;
            }
            self.acquire(member)?;
            rm.add_dependent(ResourceKind::MplsLabel, label, EntryId::NextHop(id.as_u32()))?;
            let component = Some(ComponentNh {
                nexthop: member,
                label,
            });
            let hole = members
                .iter()
                .enumerate()
                .position(|(slot, m)| m.is_none() && !cleared.contains(&slot));
            let slot = match hole {
                Some(slot) => {
                    members[slot] = component;
                    slot
                }
                None => {
                    members.push(component);
                    members.len() - 1
                }
            };
            diff.added.push(slot);
        }

        check_labels(id, &members);
        if let Some(c) = self.get_mut(id).and_then(|nh| nh.variant.as_composite_mut()) {
            c.members = members;
        }
        if !diff.is_noop() {
            debug!(
                "Rebuilt composite {id}: kept {:?} removed {:?} added {:?}",
                diff.kept, diff.removed, diff.added
            );
        }
        Ok(diff)
    }

    /// Get or create the composite with the given identity and rebuild it from `desired`.
    /// The caller gets one reference on the composite.
    pub fn find_or_create_composite(
        &mut self,
        composite: crate::CompositeNh,
        desired: &[NextHopKey],
        rm: &mut ResourceManager,
    ) -> Result<NextHopId, NextHopError> {
        let id = self.find_or_create(crate::NextHopVariant::Composite(composite), rm);
        if id.is_invalid() {
            return Ok(id);
        }
        self.rebuild_composite(id, desired, rm)?;
        Ok(id)
    }

    /// Pick the member for a flow hash among the occupied slots. Returns the slot and member.
    #[must_use]
    pub fn ecmp_member(&self, id: NextHopId, hash: u32) -> Option<(usize, ComponentNh)> {
        let composite = self.get(id)?.composite()?;
        let occupied: Vec<(usize, &ComponentNh)> = composite.occupied().collect();
        if occupied.is_empty() {
            return None;
        }
        let pick = usize::try_from(hash).ok()? % occupied.len();
        occupied.get(pick).map(|(slot, m)| (*slot, **m))
    }

    /// Slot of `member` in composite `id`.
    #[must_use]
    pub fn component_index(&self, id: NextHopId, member: NextHopId) -> Option<usize> {
        self.get(id)?
            .composite()?
            .occupied()
            .find(|(_, m)| m.nexthop == member)
            .map(|(slot, _)| slot)
    }

    /// Label keys of every occupied slot of every composite, including composites pending
    /// deletion, which still hold their labels.
    #[must_use]
    pub fn component_label_keys(&self) -> Vec<ResourceKey> {
        self.iter()
            .filter_map(|nh| Some((nh.id(), nh.composite()?)))
            .flat_map(|(id, c)| {
                c.occupied().map(move |(_, m)| ResourceKey::ComponentLabel {
                    composite: id.as_u32(),
                    member: m.nexthop.as_u32(),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn member_label(&self, id: NextHopId, slot: usize) -> Option<ResourceIndex> {
        let composite = self.get(id)?.composite()?;
        composite.members.get(slot).copied().flatten().map(|m| m.label)
    }
}

/// Two slots of one composite never share a label.
fn check_labels(id: NextHopId, members: &[Option<ComponentNh>]) {
    let mut labels = BTreeSet::new();
    for m in members.iter().flatten() {
        if m.label.is_valid() && !labels.insert(m.label) {
            error!("Composite {id} has label {} on two members", m.label);
            debug_assert!(false, "overlapping labels in composite {id}");
        }
    }
}
