// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]

mod args;

use crate::args::{CmdArgs, Parser};

use color_eyre::eyre::{WrapErr, eyre};
use config::AgentConfig;
use flow::TracingDataplane;
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use tracectl::{LevelFilter, get_trace_ctl};
use tracing::{debug, info};
use vrouter_agent::Agent;

fn init_logging() {
    get_trace_ctl().set_default_level(LevelFilter::INFO);
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = CmdArgs::parse();
    if let Some(tracing) = args.tracing() {
        get_trace_ctl()
            .setup_from_string(tracing)
            .wrap_err("Invalid tracing configuration")?;
    }
    if args.show_tracing_tags() {
        get_trace_ctl().dump_targets_by_tag();
        return Ok(());
    }
    if args.show_tracing_targets() {
        get_trace_ctl().dump();
        return Ok(());
    }
    init_logging();

    let config = match args.config() {
        Some(path) => AgentConfig::load(path)
            .wrap_err_with(|| format!("Could not load {}", path.display()))?,
        None => {
            let mut config = AgentConfig::default();
            config.validate()?;
            config
        }
    };
    if args.print_config() {
        println!("{}", config.to_yaml());
        return Ok(());
    }
    info!("Starting vrouter agent...\n{config}");

    let agent = Agent::new(&config, Arc::new(TracingDataplane))?;

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|e| eyre!("failed to set SIGINT handler: {e}"))?;

    loop {
        match stop_rx.recv_timeout(args.gc_interval()) {
            Err(RecvTimeoutError::Timeout) => {
                let report = agent.gc();
                if !report.is_empty() {
                    debug!("gc: {report:?}");
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("Shutting down vrouter agent");
    let flushed = agent.flows().flush();
    let report = agent.gc();
    info!("Flushed {flushed} flows, final gc {report:?}\n{}", agent.summary());
    Ok(())
}
