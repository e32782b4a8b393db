//! CLI for meshsub
//!
//! Subcommands:
//! - `broker`: run a broker node
//! - `directory`: run the directory service brokers register with

use clap::Parser;
use meshsub::config::{Settings, load_config};
use meshsub::directory::DirectoryService;
use meshsub::mesh::BrokerNode;
use meshsub::utils::logging;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "meshsub")]
enum Command {
    /// Start a broker node
    Broker {
        /// Interface to listen on (overrides `server.host`)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides `server.port`)
        #[arg(long)]
        port: Option<u16>,
        /// Directory service address, `host:port` (overrides `directory.address`)
        #[arg(long)]
        directory: Option<String>,
    },
    /// Start the directory service
    Directory {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 7000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let result = match cmd {
        Command::Broker {
            host,
            port,
            directory,
        } => run_broker(settings, host, port, directory).await,
        Command::Directory { host, port } => run_directory(&host, port).await,
    };

    if let Err(e) = result {
        error!("meshsub failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_broker(
    mut settings: Settings,
    host: Option<String>,
    port: Option<u16>,
    directory: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }
    if directory.is_some() {
        settings.directory.address = directory;
    }

    let (node, listener) = BrokerNode::bind(settings).await?;
    info!(address = %node.address(), "starting broker");

    tokio::select! {
        _ = std::sync::Arc::clone(&node).run(listener) => {
            error!("Broker server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn run_directory(host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind((host, port)).await?;
    let service = DirectoryService::new();

    tokio::select! {
        _ = service.serve(listener) => {
            error!("Directory service exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }
    Ok(())
}
