//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p slither_client -- [--addr 127.0.0.1:40000] [--name Player] [--tick-hz 64] [--config game.json] [--seed 7]
//!
//! The client connects, asks for a character, steers it around the field and
//! logs length changes until the game is over or the server goes away.

use std::env;
use std::time::Duration;

use anyhow::Context;
use slither_client::client::GameClient;
use slither_client::input::Wander;
use slither_shared::{
    config::GameConfig,
    event::{EatSound, GameOver, LengthChanged},
};
use tracing::{debug, info};

fn parse_args() -> anyhow::Result<GameConfig> {
    let args: Vec<String> = env::args().collect();

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
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
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
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;
    let mut lengths = client.observer.subscribe::<LengthChanged>();
    let mut sounds = client.observer.subscribe::<EatSound>();
    let mut game_over = client.observer.subscribe::<GameOver>();
    client.send_ready().await?;

    let mut wander = Wander::new(cfg.bounds, cfg.seed);
    let tick_interval = Duration::from_secs_f32(cfg.tick_secs());

    loop {
        client.poll_reliable().await?;

        // UI/audio stand-ins.
        for LengthChanged(length) in lengths.drain() {
            info!(length, "Length changed");
        }
        for EatSound in sounds.drain() {
            info!("*crunch*");
        }
        if game_over.try_next().is_some() {
            let winner = client.observer.defeated_by();
            info!(winner = ?winner, "Game over");
        }
        if client.is_shutdown() {
            break;
        }

        let head = client
            .observer
            .own_head()
            .and_then(|h| client.observer.world().position(h));
        client
            .tick(tick_interval.as_secs_f32(), wander.sample(head))
            .await?;
        client.recv_snapshot().await?;
        if let Some(head) = client.head_sample(1.0) {
            debug!(x = head.position.x, y = head.position.y, "Head");
        }

        tokio::time::sleep(tick_interval).await;
    }

    info!("Disconnected from server.");
    Ok(())
}
