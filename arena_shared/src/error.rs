//! Error taxonomy for the network core.
//!
//! Expected races (an update or deletion naming an entity the receiver no
//! longer knows) are not errors and never show up here; receivers treat them
//! as no-ops.

use thiserror::Error;

use crate::{connection::ConnectionId, dispatch::HandlerId, gob::GobId};

/// Errors raised by the shared network core.
#[derive(Debug, Error)]
pub enum NetError {
    /// Canonical identifier tables disagree between the peers.
    #[error("protocol mismatch at index {index}: local {local:?}, remote {remote:?}")]
    ProtocolMismatch {
        index: usize,
        local: String,
        remote: String,
    },

    /// The peers speak different protocol versions.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    /// A creation message collided with a live entity id.
    #[error("duplicate entity id {0:?}")]
    DuplicateEntityId(GobId),

    /// A handler was invoked after it had been deregistered.
    #[error("handler {0:?} has been disposed")]
    DisposedHandler(HandlerId),

    /// A send was attempted on a dropped connection.
    #[error("connection {0:?} is dropped")]
    ConnectionDropped(ConnectionId),

    /// The underlying link failed or was closed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A frame header named a topic this build does not know.
    #[error("unknown message header {0:#06x}")]
    UnknownTopic(u16),

    /// A frame or gob payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A creation message named a gob type that is not registered.
    #[error("unknown gob type {0:?}")]
    UnknownGobType(String),
}

impl From<serde_json::Error> for NetError {
    fn from(e: serde_json::Error) -> Self {
        NetError::Decode(e.to_string())
    }
}
