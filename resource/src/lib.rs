// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Allocation of small integer resources: MPLS labels and link-local source ports.
//!
//! Resources are allocated under a [`ResourceKey`]. Allocation is idempotent per key and
//! reference counted. Releasing the last reference does not make the index reusable right away:
//! the index is staged and only returned to its pool by a later [`ResourceManager::gc`] pass,
//! once every db entry registered as depending on it has been torn down by all its listeners.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

mod dbstate;
mod errors;
mod key;
mod manager;
mod pool;

pub use dbstate::{DbState, DbStateTable, EntryId, Listener, ListenerId};
pub use errors::ResourceError;
pub use key::{LinkLocalPortKey, ResourceKey, ResourceKind};
pub use manager::{IndexResource, ResourceIndex, ResourceManager, ResourceState};

use tracectl::{LevelFilter, trace_target};
trace_target!("resource", LevelFilter::INFO, &["resource"]);
