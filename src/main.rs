// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! HelmGuard - helmet/bike safety interlock service

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use helmguard::{Config, Engine, WebSocketServer, NAME, VERSION};

/// HelmGuard - keeps the bike blocked while the rider is drunk
#[derive(Parser, Debug)]
#[command(name = "helmguard")]
#[command(author = "HelmGuard Project")]
#[command(version = VERSION)]
#[command(about = "Helmet/bike safety interlock service")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for snapshots and the log journal
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// WebSocket server port
    #[arg(long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load or create configuration
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_create(&config_path)?;
    config.apply_env();

    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(port) = args.port {
        config.streaming.websocket_port = port;
    }

    // Initialize logging
    let log_level = if args.trace {
        Level::TRACE
    } else if args.debug {
        Level::DEBUG
    } else {
        Level::from_str(&config.log_level).unwrap_or(Level::INFO)
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("🪖 {} v{} - helmet/bike safety interlock", NAME, VERSION);
    info!("Configuration loaded from {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let streaming = config.streaming.clone();

    let engine = Arc::new(Engine::open(config).await?);
    engine.start().await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let server = if streaming.websocket_enabled {
        let server = WebSocketServer::new(&streaming, engine.clone());
        server.start(shutdown_rx).await?;
        Some(server)
    } else {
        warn!("WebSocket server disabled; bikes can only poll");
        None
    };

    info!("🚀 {} running", NAME);
    info!("   Press Ctrl+C to shutdown");

    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received, cleaning up...");

    let _ = shutdown_tx.send(());
    drop(server);
    engine.stop().await?;

    info!("{} shutdown complete", NAME);

    Ok(())
}
