// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Configuration and validation failures.

use thiserror::Error;

/// The reasons why an agent configuration may be rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid number of flow table shards: {0}. Must be a non-zero power of two")]
    InvalidShardCount(usize),
    #[error("Invalid link-local port range {0}-{1}")]
    BadPortRange(u16, u16),
    #[error("Link-local port range leaves no usable port")]
    NoUsablePort,
    #[error("Invalid MPLS label range: start {start}, count {count}")]
    BadLabelRange { start: u32, count: u32 },
    #[error("Invalid nexthop table size: {0}")]
    BadNextHopCount(u32),
    #[error("Could not read configuration file '{0}': {1}")]
    Io(String, String),
    #[error("Could not parse configuration: {0}")]
    Parse(String),
}

pub type ConfigResult = Result<(), ConfigError>;
