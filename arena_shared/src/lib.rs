//! `arena_shared`
//!
//! Network core used by both client and server.
//!
//! Design goals:
//! - Explicit context objects; no global session state.
//! - Transport-agnostic: everything above [`transport`] only sees links.
//! - Expected races (stale ids, late updates) are no-ops, not errors.
//! - No `unsafe`.

pub mod clock;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod gob;
pub mod gobs;
pub mod lag;
pub mod math;
pub mod protocol;
pub mod transport;
pub mod world;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::clock::{ClockSync, FrameCounter, FrameNumber};
    pub use crate::config::*;
    pub use crate::connection::{
        Connection, ConnectionId, ConnectionRole, ConnectionSet, SourceClass, StatusFlags,
    };
    pub use crate::dispatch::{DispatchContext, Dispatcher, HandlerId};
    pub use crate::error::NetError;
    pub use crate::event::*;
    pub use crate::gob::{Gob, GobId, GobRecord, GobRegistry, MoveType, Simulation};
    pub use crate::math::*;
    pub use crate::protocol::*;
    pub use crate::transport::{Channel, Frame, Link};
    pub use crate::world::{GobWorld, NewGob};
}
