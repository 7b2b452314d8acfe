//! `arena_client`
//!
//! Client-side systems:
//! - Server link, handshake and arena lifecycle
//! - Mirroring server-created gobs with lag-compensated reads
//! - Local authority over owned gobs and per-tick control updates
//! - Frame synchronization against the server clock

pub mod client;
pub mod handlers;
pub mod input;

pub use client::{ArenaClient, ClientContext};
