// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::path::PathBuf;
use std::time::Duration;

pub(crate) use clap::Parser;

#[derive(Parser)]
#[command(name = "vrouter agent")]
#[command(version = "0.1")]
#[command(about = "Forwarding-control core of a vrouter agent", long_about = None)]
pub(crate) struct CmdArgs {
    #[arg(long, value_name = "YAML configuration file")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "comma-separated tag=level list")]
    tracing: Option<String>,
    #[arg(long, default_value_t = false)]
    show_tracing_tags: bool,
    #[arg(long, default_value_t = false)]
    show_tracing_targets: bool,
    #[arg(long, value_name = "gc period in milliseconds", default_value_t = 1000)]
    gc_interval_ms: u64,
    #[arg(long, default_value_t = false)]
    print_config: bool,
}

impl CmdArgs {
    pub fn config(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }
    pub fn tracing(&self) -> Option<&str> {
        self.tracing.as_deref()
    }
    pub fn show_tracing_tags(&self) -> bool {
        self.show_tracing_tags
    }
    pub fn show_tracing_targets(&self) -> bool {
        self.show_tracing_targets
    }
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }
    pub fn print_config(&self) -> bool {
        self.print_config
    }
}
