//! `slither_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - Deterministic where practical (ordered maps, seedable RNG upstream).
//! - Clear separation of concerns (net, ecs, pool, chain, collision).
//! - Session state is passed explicitly; no globals.
//! - No `unsafe`.

pub mod chain;
pub mod collision;
pub mod config;
pub mod ecs;
pub mod event;
pub mod math;
pub mod net;
pub mod pool;
pub mod replicated;
pub mod schedule;
pub mod spawn;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::chain::*;
    pub use crate::collision::*;
    pub use crate::config::*;
    pub use crate::ecs::*;
    pub use crate::event::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::pool::*;
    pub use crate::replicated::*;
    pub use crate::schedule::*;
    pub use crate::spawn::*;
}
