//! Library entrypoint for wsapi-server so other binaries and tests can
//! embed the daemon or talk to one.

pub mod cli;
pub mod config;
pub mod demo;
pub mod remote;
pub mod server;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::{config::ServerConfig, demo::ItemStore};

pub use remote::connect;

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Run the daemon with the demo item store using CLI args (parsed by the caller).
pub async fn run_with_cli(cli: cli::Cli) -> Result<()> {
    init_tracing(cli.verbose)?;

    let cfg = ServerConfig::from_cli(&cli)?;
    let store = ItemStore::seeded();

    server::serve(cfg, store.definition()).await
}
