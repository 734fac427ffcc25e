// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Nexthops: how a packet is delivered.
//!
//! Nexthops are owned by a single [`NextHopStore`] and shared by id. They are de-duplicated by
//! structural [`NextHopKey`] and reference counted. Composite nexthops keep an ordered, sparse
//! list of members, each owning an MPLS label from the [`resource::ResourceManager`].

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

mod composite;
mod display;
mod errors;
mod state;
mod store;
mod variant;

pub use composite::CompositeDiff;
pub use display::NextHopInfo;
pub use errors::NextHopError;
pub use state::{ForwardingState, GcReport, SharedForwardingState};
pub use store::{NextHop, NextHopId, NextHopStore, NhState};
pub use variant::{
    ComponentNh, CompositeNh, CompositeType, MacAddress, NextHopKey, NextHopVariant, TunnelEncap,
};

use tracectl::{LevelFilter, trace_target};
trace_target!("nexthop", LevelFilter::INFO, &["nexthop"]);
