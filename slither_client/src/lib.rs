//! `slither_client`
//!
//! Client-side systems:
//! - Connection management (reliable + unreliable channels)
//! - Observer session: replicated spawns, lengths and tail chains
//! - Input capture and command generation
//! - Interpolation for remote entity states

pub mod client;
pub mod input;
pub mod interp;
pub mod observer;

pub use client::GameClient;
pub use observer::Observer;
