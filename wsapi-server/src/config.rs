use std::time::Duration;

use anyhow::{bail, Result};
use wsapi_core::EngineConfig;

use crate::cli::Cli;

/// Runtime configuration derived from CLI/env.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub ws_path: String,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if !cli.ws_path.starts_with('/') {
            bail!("websocket path must start with '/', got {:?}", cli.ws_path);
        }
        if cli.sweep_secs == 0 {
            bail!("sweep interval must be at least one second");
        }

        Ok(Self {
            listen_addr: cli.listen_addr.clone(),
            ws_path: cli.ws_path.clone(),
            engine: EngineConfig {
                sweep_interval: Duration::from_secs(cli.sweep_secs),
            },
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8788".to_string(),
            ws_path: "/ws".to_string(),
            engine: EngineConfig::default(),
        }
    }
}
