use clap::Parser;

/// CLI for the live query daemon.
#[derive(Debug, Clone, Parser)]
#[command(name = "wsapi", about = "Live query cache served over WebSocket")]
pub struct Cli {
    /// Listen address for HTTP/WS endpoints
    #[arg(long, env = "WSAPI_ADDR", default_value = "127.0.0.1:8788")]
    pub listen_addr: String,

    /// Route that accepts WebSocket upgrades
    #[arg(long, env = "WSAPI_WS_PATH", default_value = "/ws")]
    pub ws_path: String,

    /// Seconds between two sweeps of unreferenced cache entries
    #[arg(long, env = "WSAPI_SWEEP_SECS", default_value = "43200")]
    pub sweep_secs: u64,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,
}
