//! wsapi: live query cache daemon.
//!
//! Serves the demo item store over WebSocket; clients subscribe with `get`,
//! mutate with `set`, and receive pushes whenever a tag they depend on is
//! invalidated.

use anyhow::Result;
use clap::Parser;
use wsapi_server::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    wsapi_server::run_with_cli(cli).await
}
