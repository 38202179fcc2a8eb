//! Configuration system.
//!
//! Loads game configuration from JSON strings/files. Every field has a default
//! matching the shipped game, so `{}` is a valid configuration.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::pool::TemplateId;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// RNG seed for spawn positions. `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub bounds: Bounds,
    #[serde(default)]
    pub food: FoodConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub tail: TailConfig,
    /// Templates registered with the entity pool at session start.
    #[serde(default = "default_pool_templates")]
    pub pool: Vec<PoolTemplateConfig>,
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_tick_hz() -> u32 {
    64
}

fn default_player_name() -> String {
    "Player".to_string()
}

fn default_pool_templates() -> Vec<PoolTemplateConfig> {
    vec![PoolTemplateConfig {
        template: TemplateId::FOOD,
        prewarm_count: 30,
    }]
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            player_name: default_player_name(),
            seed: None,
            bounds: Bounds::default(),
            food: FoodConfig::default(),
            player: PlayerConfig::default(),
            tail: TailConfig::default(),
            pool: default_pool_templates(),
        }
    }
}

impl GameConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Duration of one simulation tick in seconds. A zero `tick_hz` counts
    /// as 1 Hz.
    pub fn tick_secs(&self) -> f32 {
        1.0 / self.tick_hz.max(1) as f32
    }
}

/// Play-field half extents; food spawns in `[-half_width, half_width] x [-half_height, half_height]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub half_width: f32,
    pub half_height: f32,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            half_width: 9.0,
            half_height: 6.0,
        }
    }
}

/// Food spawning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoodConfig {
    /// Spawned synchronously when the session starts.
    pub initial_count: usize,
    /// No periodic spawn while this many are active.
    pub max_count: usize,
    /// Seconds between periodic spawn attempts.
    pub spawn_interval_secs: f32,
    pub radius: f32,
}

impl Default for FoodConfig {
    fn default() -> Self {
        Self {
            initial_count: 10,
            max_count: 30,
            spawn_interval_secs: 3.0,
            radius: 0.15,
        }
    }
}

/// Player head movement and contact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Units per second.
    pub speed: f32,
    pub head_radius: f32,
    pub segment_radius: f32,
    /// Seconds a character ignores further contacts after one resolved.
    pub collision_lock_secs: f32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            speed: 3.0,
            head_radius: 0.25,
            segment_radius: 0.2,
            collision_lock_secs: 0.5,
        }
    }
}

/// Tail segment follow behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// Gap kept behind the followed transform.
    pub distance: f32,
    /// Fraction pulled back toward the segment's own position.
    pub delay: f32,
    /// Lerp speed factor.
    pub step: f32,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            distance: 0.3,
            delay: 0.1,
            step: 10.0,
        }
    }
}

/// One pooled template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTemplateConfig {
    pub template: TemplateId,
    #[serde(default)]
    pub prewarm_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let cfg = GameConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, GameConfig::default());
        assert_eq!(cfg.food.initial_count, 10);
        assert_eq!(cfg.food.max_count, 30);
        assert_eq!(cfg.food.spawn_interval_secs, 3.0);
        assert_eq!(cfg.player.collision_lock_secs, 0.5);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = GameConfig::from_json_str(
            r#"{ "tick_hz": 30, "food": { "max_count": 5 }, "pool": [{ "template": 2 }] }"#,
        )
        .unwrap();
        assert_eq!(cfg.tick_hz, 30);
        assert_eq!(cfg.food.max_count, 5);
        assert_eq!(cfg.food.initial_count, 10);
        assert_eq!(
            cfg.pool,
            vec![PoolTemplateConfig {
                template: TemplateId::FOOD,
                prewarm_count: 0
            }]
        );
    }

    #[test]
    fn zero_tick_rate_still_gives_a_finite_tick() {
        let cfg = GameConfig::from_json_str(r#"{ "tick_hz": 0 }"#).unwrap();
        assert_eq!(cfg.tick_secs(), 1.0);
        let tick = std::time::Duration::from_secs_f32(cfg.tick_secs());
        assert_eq!(tick, std::time::Duration::from_secs(1));

        let cfg = GameConfig::from_json_str(r#"{ "tick_hz": 64 }"#).unwrap();
        assert_eq!(cfg.tick_secs(), 1.0 / 64.0);
    }
}
