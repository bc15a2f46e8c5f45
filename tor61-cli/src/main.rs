use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tor61_core::config::Config;
use tor61_core::logging::{init_logging_with_config, LogConfig};
use tor61_core::shutdown::{install_signal_handlers, ShutdownCoordinator};
use tor61_core::{Directory, RegistryClient, RouterNode, StaticDirectory};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tor61")]
#[command(author, version, about = "Tor61 onion router with a local HTTP proxy", long_about = None)]
struct Args {
    /// Group number (0-9999)
    group: u16,

    /// Instance number within the group (0-9999)
    instance: u16,

    /// Port of the local HTTP proxy
    proxy_port: u16,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Registration service address (host:port)
    #[arg(short, long)]
    registry: Option<String>,

    /// Port other routers connect to (default: ephemeral)
    #[arg(long)]
    peer_port: Option<u16>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,
}

/// File (or defaults), then `TOR61_*` variables, then command line.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_overrides(|name| std::env::var(name).ok())?;

    config.node.group = args.group;
    config.node.instance = args.instance;
    config.node.proxy_port = args.proxy_port;
    if let Some(port) = args.peer_port {
        config.node.peer_port = port;
    }
    if let Some(registry) = &args.registry {
        config.registry.address = Some(registry.clone());
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    config.validate()?;
    Ok(config)
}

fn directory_for(config: &Config) -> Arc<dyn Directory> {
    match &config.registry.address {
        Some(addr) => Arc::new(
            RegistryClient::new(addr.clone())
                .with_router_host(config.registry.router_host.clone())
                .with_timeout(config.circuit.connect_timeout),
        ),
        None => Arc::new(StaticDirectory::with_host(
            config.registry.router_host.clone(),
            config.registry.routers.clone(),
        )),
    }
}

/// Sleep before the next boot; `false` if shutdown was requested meanwhile.
async fn reboot_pause(delay: Duration, shutdown: &ShutdownCoordinator) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.wait_for_shutdown() => false,
    }
}

/// Run nodes until shutdown, replacing the node after every fatal error.
async fn run(config: Config, shutdown: Arc<ShutdownCoordinator>) -> Result<()> {
    let mut boot = 0u32;

    loop {
        boot += 1;
        let mut node = match RouterNode::start(&config, directory_for(&config)).await {
            Ok(node) => node,
            Err(e) if e.is_fatal() => {
                warn!(boot, error = %e, "node failed to start, rebooting");
                if !reboot_pause(config.node.reboot_delay, &shutdown).await {
                    return Ok(());
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            boot,
            name = node.name(),
            agent = node.agent(),
            peer_port = node.peer_port(),
            proxy_port = node.proxy_port(),
            "Tor61 router running"
        );

        let mut fatal = node
            .fatal_errors()
            .ok_or_else(|| anyhow!("fatal error channel already taken"))?;

        tokio::select! {
            _ = shutdown.wait_for_shutdown() => {
                node.shutdown().await;
                return Ok(());
            }
            Some(e) = fatal.recv() => {
                error!(boot, error = %e, "fatal router error, rebooting");
                node.shutdown().await;
            }
        }

        if !reboot_pause(config.node.reboot_delay, &shutdown).await {
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_logging_with_config(LogConfig::try_from(&config.logging)?)?;
    info!(group = config.node.group, instance = config.node.instance, "Tor61 starting");

    let shutdown = Arc::new(ShutdownCoordinator::new());
    install_signal_handlers(shutdown.clone());

    let result = run(config, shutdown.clone()).await;
    shutdown.complete().await;
    result
}
