// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Link-time registry of tracing targets.

use crate::LevelFilter;
use linkme::distributed_slice;

/// A statically declared tracing target.
pub struct TraceTarget {
    /// What `tracing` sees as the target: the module path, or a custom string.
    pub(crate) target: &'static str,
    /// Short name, also usable as a tag.
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: &'static [&'static str],
}

impl TraceTarget {
    #[must_use]
    pub const fn new(
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) -> Self {
        Self {
            target,
            name,
            level,
            tags,
        }
    }
}

#[distributed_slice]
pub static TRACE_TARGETS: [TraceTarget];

#[doc(hidden)]
#[macro_export]
macro_rules! __register_target {
    ($target:expr, $name:expr, $level:expr, $tags:expr) => {
        // one anonymous const scope per invocation so that the static names never collide
        const _: () = {
            use $crate::targets::{TRACE_TARGETS, TraceTarget};

            #[linkme::distributed_slice(TRACE_TARGETS)]
            static TARGET: TraceTarget = TraceTarget::new($target, $name, $level, $tags);
        };
    };
}

/// Declare the tracing target of the current module with a name, default level and tags.
#[macro_export]
macro_rules! trace_target {
    ($name:expr, $level:expr, $tags:expr) => {
        $crate::__register_target!(module_path!(), $name, $level, $tags);
    };
}

/// Declare a target that is not a module path (e.g. a dependency's target).
#[macro_export]
macro_rules! custom_target {
    ($target:expr, $level:expr, $tags:expr) => {
        $crate::__register_target!($target, $target, $level, $tags);
    };
}
