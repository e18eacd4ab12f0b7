//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// Max concurrent reconcile workers for the NodeSet controller.
    ///
    /// Overridable on the command line via `--nodeset-workers`.
    #[serde(default = "Config::default_nodeset_workers")]
    pub nodeset_workers: usize,
    /// The interval in seconds between Slurm node list polls.
    #[serde(default = "Config::default_slurm_poll_seconds")]
    pub slurm_poll_seconds: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds
    /// the application config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_nodeset_workers() -> usize {
        1
    }

    fn default_slurm_poll_seconds() -> u64 {
        30
    }
}
