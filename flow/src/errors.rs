// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlowTableError {
    #[error("Invalid number of shards: {0}. Must be a power of two.")]
    InvalidShardCount(usize),
}
