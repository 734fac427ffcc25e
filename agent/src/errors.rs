// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use config::ConfigError;
use flow::FlowTableError;
use nexthop::NextHopError;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    NextHop(#[from] NextHopError),
    #[error(transparent)]
    FlowTable(#[from] FlowTableError),
    #[error("No nexthop could be created for {0}")]
    NextHopExhausted(String),
    #[error("Unknown interface {0}")]
    UnknownInterface(u32),
}
