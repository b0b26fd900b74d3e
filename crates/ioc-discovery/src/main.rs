// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IOC discovery CLI
//!
//! Runs the discovery engine against a simulated fabric and logs every
//! delivered event.
//!
//! # Usage
//!
//! ```bash
//! # One sweep, print the topology and exit
//! ioc-discovery --fabric fabrics/lab.json --once
//!
//! # Keep sweeping with a configuration file
//! ioc-discovery --fabric fabrics/lab.json --config fabrics/engine.toml
//! ```

use anyhow::Context;
use clap::Parser;
use ioc_discovery::{
    DiscoveryEngine, DiscoveryEvent, EngineConfig, EventClasses, EventContext, SimulatedFabric,
    Topology, Verdict,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// I/O controller discovery over a simulated fabric
#[derive(Parser, Debug)]
#[command(name = "ioc-discovery")]
#[command(about = "I/O unit and controller discovery engine")]
#[command(version)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulated fabric description (JSON)
    #[arg(short, long)]
    fabric: PathBuf,

    /// Run a single sweep, print the topology and exit
    #[arg(long)]
    once: bool,

    /// Print the sweep report as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let fabric = Arc::new(
        SimulatedFabric::from_file(&args.fabric)
            .with_context(|| format!("loading {}", args.fabric.display()))?,
    );

    let engine = DiscoveryEngine::start(config, fabric.clone())?;
    let handle = engine.handle();

    handle
        .register(
            EventClasses::all(),
            |event: &DiscoveryEvent, _: &mut Option<EventContext>| {
                info!("{}", event);
                Verdict::Accept
            },
        )
        .await?;

    for point in fabric.ports() {
        handle.add_port(point).await?;
    }

    let report = handle.run_sweep().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if args.once {
        print_topology(&handle.snapshot());
        engine.stop().await?;
        return Ok(());
    }

    info!("Sweeping; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let stats = handle.stats().await?;
    info!(
        "{} sweeps completed, last generation {}",
        stats.sweeps_completed, stats.generation
    );
    engine.stop().await?;
    Ok(())
}

fn print_topology(topology: &Topology) {
    println!("{} units", topology.len());
    for unit in topology.units().values() {
        println!(
            "  unit {} \"{}\" chassis {} slot {}",
            unit.key, unit.description, unit.chassis_guid, unit.chassis_slot
        );
        for path in unit.paths.values() {
            println!("    path {} via {}", path.record, path.port_guid);
        }
        for controller in unit.controllers.values() {
            println!(
                "    ioc {} slot {} \"{}\" ({} service entries)",
                controller.guid(),
                controller.slot,
                controller.profile.id_string,
                controller.valid_entries()
            );
            for entry in controller.service_entries() {
                println!("      {} {:#018x}", entry.name, entry.id);
            }
        }
    }
}
