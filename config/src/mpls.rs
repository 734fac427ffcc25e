// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Label and nexthop index spaces

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

#[derive(Builder, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[builder(default)]
#[serde(default, deny_unknown_fields)]
pub struct MplsConfig {
    /// First label the agent may allocate. Labels below 16 are reserved by MPLS.
    pub label_start: u32,
    pub label_count: u32,
}

impl MplsConfig {
    pub const FIRST_UNRESERVED_LABEL: u32 = 16;
    pub const MAX_LABEL: u32 = (1 << 20) - 1;

    pub fn validate(&self) -> ConfigResult {
        let bad = ConfigError::BadLabelRange {
            start: self.label_start,
            count: self.label_count,
        };
        if self.label_start < Self::FIRST_UNRESERVED_LABEL || self.label_count == 0 {
            return Err(bad);
        }
        match self.label_start.checked_add(self.label_count - 1) {
            Some(last) if last <= Self::MAX_LABEL => Ok(()),
            _ => Err(bad),
        }
    }
}

impl Default for MplsConfig {
    fn default() -> Self {
        Self {
            label_start: Self::FIRST_UNRESERVED_LABEL,
            label_count: 5104,
        }
    }
}

#[derive(Builder, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[builder(default)]
#[serde(default, deny_unknown_fields)]
pub struct NextHopConfig {
    /// Size of the nexthop id space.
    pub max_nexthops: u32,
}

impl NextHopConfig {
    pub fn validate(&self) -> ConfigResult {
        if self.max_nexthops == 0 || self.max_nexthops == u32::MAX {
            return Err(ConfigError::BadNextHopCount(self.max_nexthops));
        }
        Ok(())
    }
}

impl Default for NextHopConfig {
    fn default() -> Self {
        Self {
            max_nexthops: 65536,
        }
    }
}
