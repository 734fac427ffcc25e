// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-listener state attached to shared db entries.
//!
//! Instead of storing listener state inside the entries, state lives in a side table keyed by
//! `(EntryId, ListenerId)`. An entry is considered torn down once no listener holds state on it.

use id::Id;
use std::collections::BTreeMap;
use tracing::debug;

use crate::ResourceError;

/// A db entry that may depend on an allocated resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryId {
    NextHop(u32),
    Vrf(u32),
    Interface(u32),
}

pub struct Listener;
pub type ListenerId = Id<Listener>;

/// Listener-defined handle, e.g. the dataplane index an entry was programmed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbState {
    pub handle: u32,
}

#[derive(Debug)]
pub struct DbStateTable<S = DbState> {
    listeners: BTreeMap<ListenerId, String>,
    next_listener: u32,
    states: BTreeMap<(EntryId, ListenerId), S>,
}

impl<S> Default for DbStateTable<S> {
    fn default() -> Self {
        Self {
            listeners: BTreeMap::new(),
            next_listener: 0,
            states: BTreeMap::new(),
        }
    }
}

impl<S> DbStateTable<S> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str) -> ListenerId {
        let id = ListenerId::new(self.next_listener);
        self.next_listener += 1;
        self.listeners.insert(id, name.to_owned());
        debug!("Registered db listener {name} as {id}");
        id
    }

    /// Remove a listener and every state it holds. Returns the number of states dropped.
    pub fn unregister(&mut self, listener: ListenerId) -> Result<usize, ResourceError> {
        let name = self
            .listeners
            .remove(&listener)
            .ok_or(ResourceError::UnknownListener(listener))?;
        let before = self.states.len();
        self.states.retain(|(_, l), _| *l != listener);
        let dropped = before - self.states.len();
        debug!("Unregistered db listener {name}, dropped {dropped} states");
        Ok(dropped)
    }

    #[must_use]
    pub fn listener_name(&self, listener: ListenerId) -> Option<&str> {
        self.listeners.get(&listener).map(String::as_str)
    }

    pub fn set(
        &mut self,
        entry: EntryId,
        listener: ListenerId,
        state: S,
    ) -> Result<Option<S>, ResourceError> {
        if !self.listeners.contains_key(&listener) {
            return Err(ResourceError::UnknownListener(listener));
        }
        Ok(self.states.insert((entry, listener), state))
    }

    #[must_use]
    pub fn get(&self, entry: EntryId, listener: ListenerId) -> Option<&S> {
        self.states.get(&(entry, listener))
    }

    pub fn clear(&mut self, entry: EntryId, listener: ListenerId) -> Option<S> {
        self.states.remove(&(entry, listener))
    }

    fn entry_range(
        entry: EntryId,
    ) -> std::ops::RangeInclusive<(EntryId, ListenerId)> {
        (entry, ListenerId::new(0))..=(entry, ListenerId::INVALID)
    }

    /// Whether any listener still holds state on `entry`.
    #[must_use]
    pub fn has_state(&self, entry: EntryId) -> bool {
        self.states.range(Self::entry_range(entry)).next().is_some()
    }

    #[must_use]
    pub fn holders(&self, entry: EntryId) -> Vec<ListenerId> {
        self.states
            .range(Self::entry_range(entry))
            .map(|((_, l), _)| *l)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
