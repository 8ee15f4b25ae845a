//! `gridworld`: a shared grid world served to many terminals at once.
//!
//! Static areas are loaded once into an immutable [`world::World`]. Every session feeds
//! commands into a single [`arbiter::Arbiter`], which owns players and occupancy and
//! pushes a fresh [`viewport::Viewport`] to each affected session.

pub mod arbiter;
pub mod command;
pub mod config;
pub mod movement;
pub mod occupancy;
pub mod player;
pub mod registry;
pub mod screen;
pub mod session;
pub mod viewport;
pub mod world;
