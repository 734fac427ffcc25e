// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The flow table of the agent.
//!
//! Every flow is a pair of entries, one per direction, linked to each other by key. Entries are
//! classified when the first packet is trapped, admitted against the flow ceilings of their VM
//! interface, and pushed to the dataplane through [`DataplaneSync`]. Link-local flows own a NAT
//! source port allocated from the [`resource::ResourceManager`] of the forwarding state.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

mod classify;
mod collab;
mod display;
mod entry;
mod errors;
mod flags;
mod key;
mod limits;
mod linklocal;
mod scope;
mod table;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{NewFlow, flow_hash, reverse_key};
pub use collab::{
    ConfigChangeNotifier, DataplaneSync, Interface, PacketInfo, RouteTable, StaticRouteTable,
    TracingDataplane,
};
pub use display::FlowStats;
pub use entry::{FlowEntry, LinkLocalBinding, MatchData, NatRewrite};
pub use errors::FlowTableError;
pub use flags::{FlowAction, FlowFlags, ShortFlowReason};
pub use key::FlowKey;
pub use limits::FlowLimits;
pub use linklocal::{LinkLocalService, LinkLocalServices};
pub use scope::{
    EffectiveLimit, FloatingIp, LimitSource, Scopes, VmInterface, VmInterfaceConfig,
    VmInterfaceConfigBuilder, VmScope, VnScope,
};
pub use table::FlowTable;

use tracectl::{LevelFilter, trace_target};
trace_target!("flow", LevelFilter::INFO, &["flow"]);
