//! metagraphd - Metagraph synapse registry and tensor RPC daemon
//!
//! Gossips proof-of-work gated synapse records with peers and serves
//! signed Forward/Backward tensor calls against them.

use clap::Parser;
use metagraphd::config::Config;
use metagraphd::server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &Config) {
    let default_directive = if config.verbose {
        "metagraphd=debug,metagraph_net=debug"
    } else {
        "metagraphd=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();
    init_logging(&config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "metagraphd v{} - Metagraph synapse registry daemon",
        env!("CARGO_PKG_VERSION")
    );

    // Create and run server
    let server = match Server::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Install signal handler
    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_server.shutdown();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
