//! `slither_server`
//!
//! Server-side systems:
//! - Authority session (world, pool, spawn subsystem, roster)
//! - Food spawn coordinator
//! - Collision arbitration
//! - Fixed timestep network loop
//!
//! Networking model:
//! - TCP: handshake, replication and targeted notifications
//! - UDP: gameplay plane (commands/snapshots)

pub mod authority;
pub mod resolver;
pub mod server;
pub mod spawner;

pub use authority::Authority;
pub use server::GameServer;
