//! Fleet ground control communication server
//!
//! Runs the MAVLink networks and RTK correction presets described in the
//! settings file until interrupted.

mod config;
mod network;
mod rtk_bridge;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use config::Settings;
use fleet_connect::{ConnectionFactory, DefaultConnectionFactory};
use network::MavlinkNetwork;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fleetd")]
#[command(about = "Ground control communication server for drone fleets")]
struct Args {
    /// Settings file (default: $XDG_CONFIG_HOME/fleetd/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fleetd=info,fleet_protocol=info,fleet_connect=info,fleet_link=info,fleet_rtk=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting fleetd {}", env!("CARGO_PKG_VERSION"));
    let settings = Settings::load(args.config.as_deref())?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupted, shutting down"),
                Err(e) => error!("Cannot listen for Ctrl-C: {}", e),
            }
            cancel.cancel();
        }
    });

    run(settings, cancel).await;
    info!("fleetd stopped");
    Ok(())
}

/// Run all configured networks and RTK presets until `cancel` fires
async fn run(settings: Settings, cancel: CancellationToken) {
    let factory: Arc<dyn ConnectionFactory> = Arc::new(DefaultConnectionFactory);
    let supervisor = settings.supervisor.policy();

    let mut networks = Vec::new();
    for (name, network_settings) in &settings.networks {
        match MavlinkNetwork::from_settings(name, network_settings, factory.as_ref()) {
            Ok(network) => networks.push(Arc::new(network)),
            Err(e) => error!(network = %name, "Not starting network: {:#}", e),
        }
    }

    let registry = settings.rtk.build_registry();
    if networks.is_empty() && registry.is_empty() {
        warn!("No networks or RTK presets configured");
    }

    let mut tasks = JoinSet::new();
    for network in &networks {
        let network = network.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = network.run(&supervisor, cancel).await {
                error!(network = %network.name(), "Network stopped: {}", e);
            }
        });
    }
    if !registry.is_empty() {
        info!("Starting {} RTK preset(s)", registry.len());
        let networks = networks.clone();
        let factory = factory.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            rtk_bridge::run_corrections(&registry, networks, factory, supervisor, cancel).await;
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Server task failed: {}", e);
        }
    }
}
