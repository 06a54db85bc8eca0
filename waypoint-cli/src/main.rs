mod config;
mod ring;
mod simulate;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use ring::Ring;
use simulate::Simulate;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "waypoint")]
#[command(about = "Explore waypoint load balancing: simulate a topology or inspect a hash ring")]
#[command(version)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Serve the balancer metrics for Prometheus on this address. Example: 127.0.0.1:9040"
    )]
    prom_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run simulated traffic against a topology described in YAML")]
    Simulate(Simulate),

    #[command(about = "Build a hash ring and print how keys spread over its endpoints")]
    Ring(Ring),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Some(prom_addr) = cli.prom_addr {
        let addr: SocketAddr = prom_addr.parse().context(format!(
            "Failed to parse into Socket address: {}",
            prom_addr
        ))?;
        init_metrics(addr)?;
    }

    match cli.command {
        Commands::Simulate(simulate) => simulate::handle_simulate(simulate).await?,
        Commands::Ring(ring) => ring::handle_ring(ring)?,
    }

    Ok(())
}

fn init_metrics(addr: SocketAddr) -> Result<()> {
    info!(%addr, "initializing metrics exporter");
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus recorder")?;
    waypoint_balancer::balancer_metrics::describe_metrics();
    Ok(())
}
