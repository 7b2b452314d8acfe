//! `arena_server`
//!
//! Server-side systems:
//! - Fixed timestep arena loop
//! - Handshake, clock sync and client input handlers
//! - Per-connection entity replication (announce / update / retire)
//!
//! Networking model:
//! - Reliable channel (TCP): handshake, lifecycle, entity creation/deletion
//! - Best-effort channel (UDP): pings, entity updates, client updates

pub mod handlers;
pub mod replication;
pub mod server;

pub use server::{ArenaServer, ServerContext};
