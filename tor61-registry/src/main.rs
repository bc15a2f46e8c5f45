//! Mock registration service for local Tor61 overlays
//!
//! Routers register their peer port, name and agent id over a line protocol
//! and fetch the list of everyone currently registered.

use anyhow::Result;
use clap::Parser;
use tor61_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use tor61_core::RegistryServer;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tor61-registry")]
#[command(about = "Tor61 mock registration service", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "1337")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging_with_config(LogConfig::new(args.log_level))?;

    let server = RegistryServer::bind(&format!("{}:{}", args.host, args.port)).await?;
    info!(addr = %server.local_addr()?, "Tor61 registry started");

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
    }
    Ok(())
}
