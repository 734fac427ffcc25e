// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of tracing levels.
//!
//! Crates declare their targets with [`trace_target!`] and the targets are gathered at link time.
//! [`get_trace_ctl`] installs the subscriber on first use and lets levels be changed per tag.

pub mod control;
pub mod targets;

pub use control::{TraceCtlError, TracingControl, get_trace_ctl};
pub use tracing_subscriber::filter::LevelFilter;
