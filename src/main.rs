//! looptun command-line interface.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use looptun::host::loopback::LoopbackHost;
use looptun::{
    StatusStore, TunnelController, TunnelStatus, DEFAULT_PROVIDER_ID,
};

#[derive(Parser)]
#[command(name = "looptun")]
#[command(about = "Local loopback IPv4 tunnel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Directory backing the shared status store
    #[arg(long, default_value = "looptun-state")]
    state_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the tunnel and run until interrupted
    Run {
        /// Device address (the address packets are nominally sent to)
        #[arg(long)]
        device_ip: Option<Ipv4Addr>,

        /// Fake address (the substitute used for the rewrite)
        #[arg(long)]
        fake_ip: Option<Ipv4Addr>,

        /// Subnet mask for the virtual interface
        #[arg(long)]
        subnet_mask: Option<Ipv4Addr>,
    },
    /// Print the persisted status and configuration
    Status {
        /// Emit machine-readable JSON instead of the plain listing
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();

    let store = StatusStore::open(&cli.state_dir)
        .with_context(|| format!("Failed to open status store in {}", cli.state_dir.display()))?;

    match cli.command {
        Command::Run {
            device_ip,
            fake_ip,
            subnet_mask,
        } => run(store, &cli.state_dir, device_ip, fake_ip, subnet_mask).await,
        Command::Status { json } => {
            let config = store.read_configuration();
            if json {
                let report = serde_json::json!({
                    "status": store.read_status().as_str(),
                    "configuration": config,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("status: {}", store.read_status());
                println!("device: {}", config.device_address);
                println!("fake:   {}", config.fake_address);
                println!("mask:   {}", config.subnet_mask);
            }
            Ok(())
        }
    }
}

/// Start the tunnel through an in-process host and run until ctrl-c.
async fn run(
    store: StatusStore,
    state_dir: &std::path::Path,
    device_ip: Option<Ipv4Addr>,
    fake_ip: Option<Ipv4Addr>,
    subnet_mask: Option<Ipv4Addr>,
) -> Result<()> {
    let mut config = store.read_configuration();
    if let Some(device) = device_ip {
        config.device_address = device;
    }
    if let Some(fake) = fake_ip {
        config.fake_address = fake;
    }
    if let Some(mask) = subnet_mask {
        config.subnet_mask = mask;
    }

    let host = LoopbackHost::new(state_dir);
    let mut controller = TunnelController::new(host.clone(), store, DEFAULT_PROVIDER_ID);
    controller
        .set_configuration(&config)
        .context("Invalid tunnel configuration")?;

    controller.start().await.context("Failed to start tunnel")?;

    // Keep the packet tap alive so the flow stays open for the
    // lifetime of the run.
    let _tap = host.take_tap();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, stopping tunnel");
                break;
            }
            status = controller.next_status() => {
                match status {
                    Some(status) => info!(status = %status, "Tunnel status changed"),
                    None => {
                        warn!("Host closed the status notifier");
                        break;
                    }
                }
            }
        }
    }

    controller.stop().await.context("Failed to stop tunnel")?;
    while let Some(status) = controller.next_status().await {
        info!(status = %status, "Tunnel status changed");
        if status == TunnelStatus::Disconnected {
            break;
        }
    }

    Ok(())
}
