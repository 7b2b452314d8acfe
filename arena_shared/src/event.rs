//! Network events.
//!
//! Instead of subscriber callbacks fired mid-iteration, peers push
//! structured [`NetEvent`]s into a queue that the owning application drains
//! after the tick.

use std::collections::VecDeque;

use crate::{connection::ConnectionId, gob::GobId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// Handshake completed.
    Connected { connection: ConnectionId },
    /// Server side: a client joined the running arena and wants an actor.
    ClientReady { connection: ConnectionId },
    /// The connection is gone; on a client this is the cue to return to the
    /// menu or reconnect.
    Disconnected {
        connection: ConnectionId,
        reason: String,
    },
    /// A new arena instance started.
    ArenaStarted { arena_id: u32 },
    GobCreated { id: GobId },
    GobRetired { id: GobId },
}

/// FIFO of pending events.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<NetEvent>,
}

impl EventQueue {
    pub fn push(&mut self, e: NetEvent) {
        self.events.push_back(e);
    }

    /// Drains all queued events in push order.
    pub fn drain(&mut self) -> Vec<NetEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
