//! `portway-client`: runs beside private services and exposes them through
//! a public portway server.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use portway::client::Service;
use portway::config;
use portway::logger::{self, log};
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Reverse tunnel client")]
struct Args {
    /// Path to the INI configuration file
    #[arg(short = 'c', long = "config", env = "PORTWAY_CLIENT_CONFIG")]
    config: PathBuf,

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

    let content = std::fs::read_to_string(&args.config)
        .with_context(|| format!("cannot read config file {}", args.config.display()))?;
    let (config, proxies, visitors) =
        config::load_client_config(&content).context("invalid client configuration")?;

    let level = args
        .log_level
        .as_deref()
        .and_then(logger::LogLevel::parse)
        .or(config.log_level);
    logger::init_logger(level);

    if proxies.is_empty() && visitors.is_empty() {
        anyhow::bail!("no proxies or visitors configured");
    }
    log::info!(
        server = %format!("{}:{}", config.server_addr, config.server_port),
        proxies = proxies.len(),
        visitors = visitors.len(),
        "starting client"
    );

    let service = Service::new(config, proxies, visitors);
    let shutdown = CancellationToken::new();

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    service.run(shutdown).await.context("client failed")?;
    Ok(())
}
