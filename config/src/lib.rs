// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Agent configuration model.
//!
//! The configuration is read once at start-up (YAML) or assembled with the derived builders,
//! validated, and handed by value to the components that need it. Ceilings that are policy
//! rather than architecture (flow limits, link-local limits, index space sizes) all live here.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]

pub mod errors;
pub mod flow;
pub mod linklocal;
pub mod mpls;

pub use errors::{ConfigError, ConfigResult};
pub use flow::{FlowConfig, FlowConfigBuilder};
pub use linklocal::{LinkLocalConfig, LinkLocalConfigBuilder, PortRange};
pub use mpls::{MplsConfig, MplsConfigBuilder, NextHopConfig, NextHopConfigBuilder};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::Path;
use tracectl::{LevelFilter, trace_target};
use tracing::debug;

trace_target!("config", LevelFilter::INFO, &["agent"]);

#[derive(Builder, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[builder(default)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub flow: FlowConfig,
    pub linklocal: LinkLocalConfig,
    pub mpls: MplsConfig,
    pub nexthop: NextHopConfig,
}

impl AgentConfig {
    /// Validate all sections. May adjust values that are clamped rather than rejected.
    pub fn validate(&mut self) -> ConfigResult {
        self.flow.validate()?;
        self.linklocal.validate()?;
        self.mpls.validate()?;
        self.nexthop.validate()?;
        debug!("Validated agent configuration:\n{self}");
        Ok(())
    }

    /// Parse and validate a YAML document. Missing sections and fields take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: AgentConfig =
            serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        Self::from_yaml(&yaml)
    }

    #[must_use]
    pub fn to_yaml(&self) -> String {
        serde_yaml_ng::to_string(self).unwrap_or_default()
    }
}

impl Display for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ll = &self.linklocal;
        writeln!(f, "Agent config")?;
        writeln!(f, "  flow shards         : {}", self.flow.shards)?;
        writeln!(f, "  max vm flows        : {}", self.flow.max_vm_flows)?;
        writeln!(f, "  link-local system   : {}", ll.system_flows)?;
        writeln!(f, "  link-local per vm   : {}", ll.vm_flows)?;
        writeln!(
            f,
            "  link-local ports    : {}-{} (reserved {:?})",
            ll.port_range.start, ll.port_range.end, ll.reserved_ports
        )?;
        writeln!(
            f,
            "  mpls labels         : {} (+{})",
            self.mpls.label_start, self.mpls.label_count
        )?;
        write!(f, "  nexthops            : {}", self.nexthop.max_nexthops)
    }
}
