// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Nexthop store errors

use resource::ResourceError;
use thiserror::Error;

use crate::{NextHopId, NextHopKey};

#[derive(Error, Debug, PartialEq)]
pub enum NextHopError {
    #[error("No nexthop with id {0}")]
    UnknownNextHop(NextHopId),
    #[error("Nexthop {0} is not a composite")]
    NotComposite(NextHopId),
    #[error("Nexthop {id} has key {current}, cannot change it to {requested}")]
    KeyMismatch {
        id: NextHopId,
        current: NextHopKey,
        requested: NextHopKey,
    },
    #[error("Members of composite {0} can only change through a rebuild")]
    CompositeChange(NextHopId),
    #[error("Nexthop {0} is pending deletion")]
    PendingDelete(NextHopId),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}
