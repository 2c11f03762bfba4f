//! `portway-server`: the public rendezvous side of the tunnel.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use portway::config;
use portway::logger::{self, log};
use portway::server::Service;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Reverse tunnel server")]
struct Args {
    /// Path to the INI configuration file
    #[arg(short = 'c', long = "config", env = "PORTWAY_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {}", path.display()))?;
            config::load_server_config(&content).context("invalid server configuration")?
        }
        None => config::ServerConfig::default(),
    };

    let level = args
        .log_level
        .as_deref()
        .and_then(logger::LogLevel::parse)
        .or(config.log_level);
    logger::init_logger(level);

    let service = Service::new(config).await.context("server setup failed")?;
    let shutdown = service.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    Arc::clone(&service).run().await.context("server failed")?;
    Ok(())
}
