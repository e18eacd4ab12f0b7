//! The Slinky NodeSet operator.

mod app;
mod config;
mod controller;
mod slurm;

#[cfg(test)]
mod fixtures;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

/// Command line options of the operator.
#[derive(StructOpt)]
#[structopt(name = "slinky-operator")]
struct Opts {
    /// Max concurrent workers for the NodeSet controller.
    #[structopt(long = "nodeset-workers")]
    nodeset_workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let opts = Opts::from_args();
    let mut config = Config::new()?;
    if let Some(workers) = opts.nodeset_workers {
        config.nodeset_workers = workers;
    }
    let config = Arc::new(config);

    tracing::info!(
        workers = %config.nodeset_workers,
        "starting Slinky NodeSet operator",
    );
    if let Err(err) = App::new(config).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
