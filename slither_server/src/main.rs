//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p slither_server -- [--addr 127.0.0.1:40000] [--tick-hz 64] [--config game.json] [--seed 42]
//!
//! The server starts the authority session, accepts clients, runs a fixed
//! timestep simulation and replicates state. Ctrl-C tears the session down
//! before exiting.

use std::env;
use std::time::Duration;

use anyhow::Context;
use slither_server::server::GameServer;
use slither_shared::config::GameConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn parse_args() -> anyhow::Result<GameConfig> {
    let args: Vec<String> = env::args().collect();

    // The config file is the base; flags override it.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => GameConfig::from_file(&args[i + 1])?,
        _ => GameConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(64);
                i += 2;
            }
            "--seed" if i + 1 < args.len() => {
                cfg.seed = args[i + 1].parse().ok();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, seed = ?cfg.seed, "Starting server");

    let mut server = GameServer::new(cfg.clone())
        .await
        .context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");
    server.start().await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    let tick_interval = Duration::from_secs_f32(cfg.tick_secs());
    let mut next_tick = tokio::time::Instant::now();

    loop {
        // Accept new clients (non-blocking).
        match server.try_accept(Duration::from_millis(1)).await {
            Ok(admitted) => {
                for cid in admitted {
                    info!(client_id = ?cid, "New client accepted");
                }
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }

        server.step(tick_interval.as_secs_f32()).await?;

        // Wait for next tick.
        next_tick += tick_interval;
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(next_tick) => {}
        }
    }

    info!("Shutting down");
    server.shutdown().await;
    Ok(())
}
