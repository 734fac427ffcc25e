// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow table settings

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

#[derive(Builder, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[builder(default)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    /// Number of independent flow table shards. Power of two.
    pub shards: usize,
    /// Per-VM ceiling used when neither the interface nor its VN sets one. 0 means unlimited.
    pub max_vm_flows: u32,
}

impl FlowConfig {
    pub const DEFAULT_SHARDS: usize = 16;

    pub fn validate(&self) -> ConfigResult {
        if self.shards == 0 || !self.shards.is_power_of_two() {
            return Err(ConfigError::InvalidShardCount(self.shards));
        }
        Ok(())
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            shards: Self::DEFAULT_SHARDS,
            max_vm_flows: 0,
        }
    }
}
