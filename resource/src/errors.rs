// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::{ListenerId, ResourceKind};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Listener {0} is not registered")]
    UnknownListener(ListenerId),
    #[error("No {kind} with index {index}")]
    UnknownIndex { kind: ResourceKind, index: u32 },
    #[error("Index space for {0} is empty")]
    EmptySpace(ResourceKind),
}
