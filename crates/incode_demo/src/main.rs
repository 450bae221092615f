use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use incode_demo::{DemoConfig, Scenario};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "incode_demo", about = "Run in-code storage scenarios against demo codes")]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of particles to create
    #[arg(short, long)]
    particles: Option<usize>,

    /// Cells per side of the hydro grid
    #[arg(short, long)]
    grid_size: Option<usize>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_filter: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DemoConfig::load(path)?,
        None => DemoConfig::default(),
    };
    if let Some(particles) = args.particles {
        config = config.with_particles(particles);
    }
    if let Some(grid_size) = args.grid_size {
        config = config.with_grid_size(grid_size);
    }
    if let Some(filter) = args.log_filter {
        config = config.with_log_filter(filter);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)))
        .init();

    info!(config = ?args.config, "configuration loaded");
    let report = Scenario::new(config).run().context("scenario failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
