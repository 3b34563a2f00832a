use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;

use wirebound::app::dispatcher::Dispatcher;
use wirebound::app::outbound_manager::OutboundManager;
use wirebound::app::policy::PolicyManager;
use wirebound::dns::SystemResolver;
use wirebound::proxy::inbound::wireguard::WireGuardInbound;
use wirebound::router::Router;

#[derive(Parser)]
#[command(
    name = "wirebound",
    version,
    about = "WireBound - userspace tunnel kernel"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the kernel (default when no subcommand given)
    Run,

    /// Validate config file syntax and semantics
    Check,
}

fn init_logging(level: &str) {
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
    );
    tracing_subscriber::registry().with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => {
            let config = wirebound::config::load(&cli.config)?;
            println!(
                "config ok: {} inbound(s), {} outbound(s)",
                config.inbounds.len(),
                config.outbounds.len()
            );
            Ok(())
        }
        Commands::Run => run(&cli.config).await,
    }
}

async fn run(config_path: &str) -> Result<()> {
    let config = wirebound::config::load(config_path)?;
    init_logging(&config.log.level);

    let router = Arc::new(Router::new(&config.router));
    let outbound_manager = Arc::new(OutboundManager::new(&config.outbounds)?);
    let dispatcher = Arc::new(Dispatcher::new(router, outbound_manager));
    let policy = Arc::new(PolicyManager::new(&config.policy));
    let dns = Arc::new(SystemResolver);

    let mut servers = Vec::new();
    for inbound in &config.inbounds {
        match inbound.protocol.as_str() {
            "wireguard" => {
                let server = WireGuardInbound::new(inbound, policy.clone(), dns.clone())?;
                let bind_addr = format!("{}:{}", inbound.listen, inbound.port);
                let socket = tokio::net::UdpSocket::bind(&bind_addr).await?;
                let dispatcher = dispatcher.clone();
                servers.push(tokio::spawn(async move {
                    server.serve(socket, dispatcher).await
                }));
            }
            other => anyhow::bail!("unsupported inbound protocol: {}", other),
        }
    }

    info!(inbounds = servers.len(), "wirebound started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for server in servers {
        server.abort();
    }
    Ok(())
}
