//! Connections.
//!
//! A [`Connection`] wraps one [`Link`] and owns:
//! - per-message-kind inbound FIFO queues, filled by [`Connection::pump`];
//! - the [`ClockSync`] for that peer;
//! - lifecycle state (Connecting -> Established -> Dropped) and status flags.
//!
//! The announced-entity sets are not here; they belong to the server's
//! replication engine.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    clock::ClockSync,
    config::NetConfig,
    error::NetError,
    protocol::{Message, MessageKind},
    transport::Link,
};

/// Identifies a connection on one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

/// What the connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Server side: one slot per connected client.
    ClientSlot,
    /// Client side: the single link to the game server.
    Server,
    /// Link to the management server.
    Management,
}

/// Which connections a dispatch handler listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceClass {
    AllClients,
    GameServer,
    Management,
}

impl SourceClass {
    pub fn matches(self, role: ConnectionRole) -> bool {
        matches!(
            (self, role),
            (SourceClass::AllClients, ConnectionRole::ClientSlot)
                | (SourceClass::GameServer, ConnectionRole::Server)
                | (SourceClass::Management, ConnectionRole::Management)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    Dropped { reason: String },
}

/// Flags read and written by the game-state layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub handshake_key: Option<u64>,
    pub ready_to_start: bool,
    pub playing_arena: bool,
    pub requested_spawn_arena_id: Option<u32>,
}

pub struct Connection {
    id: ConnectionId,
    role: ConnectionRole,
    state: ConnectionState,
    link: Link,
    inbox: HashMap<MessageKind, VecDeque<Message>>,
    clock: ClockSync,
    handshake_deadline: Instant,
    pub status: StatusFlags,
}

impl Connection {
    pub fn new(id: ConnectionId, role: ConnectionRole, link: Link, cfg: &NetConfig, now: Instant) -> Self {
        Self {
            id,
            role,
            state: ConnectionState::Connecting,
            link,
            inbox: HashMap::new(),
            clock: ClockSync::new(cfg, now),
            handshake_deadline: now + cfg.handshake_timeout(),
            status: StatusFlags::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self.state, ConnectionState::Dropped { .. })
    }

    pub fn drop_reason(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Dropped { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut ClockSync {
        &mut self.clock
    }

    /// Connecting -> Established. No-op in any other state.
    pub fn establish(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Established;
            info!(connection = ?self.id, role = ?self.role, "Connection established");
        }
    }

    /// Marks the connection dropped, discards queued messages and closes the
    /// link. The first reason wins.
    pub fn drop_with(&mut self, reason: impl Into<String>) {
        if self.is_dropped() {
            return;
        }
        let reason = reason.into();
        info!(connection = ?self.id, reason = %reason, "Connection dropped");
        self.state = ConnectionState::Dropped { reason };
        self.inbox.clear();
        self.link.close();
    }

    /// Enqueues a message for transmission. Never blocks.
    pub fn send(&mut self, msg: &Message) -> Result<(), NetError> {
        if self.is_dropped() {
            return Err(NetError::ConnectionDropped(self.id));
        }
        let frame = msg.encode()?;
        if let Err(e) = self.link.send(frame) {
            self.drop_with("transport closed");
            return Err(e);
        }
        Ok(())
    }

    /// Moves everything the transport delivered into the per-kind queues.
    /// Returns the number of messages queued.
    pub fn pump(&mut self) -> usize {
        if self.is_dropped() {
            return 0;
        }
        let mut queued = 0;
        loop {
            match self.link.try_recv() {
                Ok(Some(frame)) => match Message::decode(&frame.bytes) {
                    Ok(msg) => {
                        self.inbox.entry(msg.kind()).or_default().push_back(msg);
                        queued += 1;
                    }
                    Err(e) => {
                        warn!(connection = ?self.id, error = %e, "Dropping undecodable frame");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(connection = ?self.id, error = %e, "Link failed");
                    // A closing notice delivered just before the close names
                    // the real reason.
                    let reason = match self.dequeue(MessageKind::ConnectionClosing) {
                        Some(Message::ConnectionClosing(c)) => format!("closed by peer: {}", c.reason),
                        _ => "transport closed".to_string(),
                    };
                    self.drop_with(reason);
                    break;
                }
            }
        }
        queued
    }

    pub fn dequeue(&mut self, kind: MessageKind) -> Option<Message> {
        self.inbox.get_mut(&kind).and_then(|q| q.pop_front())
    }

    pub fn queued(&self, kind: MessageKind) -> usize {
        self.inbox.get(&kind).map_or(0, |q| q.len())
    }

    /// Discards queued messages of kinds nobody handles. Returns the count.
    pub fn discard_unserved(&mut self, served: &HashSet<MessageKind>) -> usize {
        let mut discarded = 0;
        for (kind, queue) in self.inbox.iter_mut() {
            if !served.contains(kind) && !queue.is_empty() {
                debug!(connection = ?self.id, ?kind, count = queue.len(), "Discarding unhandled messages");
                discarded += queue.len();
                queue.clear();
            }
        }
        discarded
    }

    /// Drops the connection if it is still handshaking past its deadline.
    pub fn check_handshake_timeout(&mut self, now: Instant) -> bool {
        if self.state == ConnectionState::Connecting && now >= self.handshake_deadline {
            self.drop_with("handshake timed out");
            return true;
        }
        false
    }
}

/// All connections of one peer, iterated in id order.
pub struct ConnectionSet {
    next_id: u32,
    conns: BTreeMap<ConnectionId, Connection>,
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self {
            next_id: 1,
            conns: BTreeMap::new(),
        }
    }
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: ConnectionRole, link: Link, cfg: &NetConfig, now: Instant) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.conns.insert(id, Connection::new(id, role, link, cfg, now));
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.values_mut()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Live connections of a source class.
    pub fn ids_of(&self, class: SourceClass) -> Vec<ConnectionId> {
        self.conns
            .values()
            .filter(|c| class.matches(c.role) && !c.is_dropped())
            .map(|c| c.id)
            .collect()
    }

    pub fn send(&mut self, id: ConnectionId, msg: &Message) -> Result<(), NetError> {
        match self.conns.get_mut(&id) {
            Some(conn) => conn.send(msg),
            None => Err(NetError::ConnectionDropped(id)),
        }
    }

    pub fn pump_all(&mut self) -> usize {
        self.conns.values_mut().map(Connection::pump).sum()
    }

    pub fn check_handshake_timeouts(&mut self, now: Instant) {
        for conn in self.conns.values_mut() {
            if conn.check_handshake_timeout(now) {
                warn!(connection = ?conn.id, "Handshake timed out");
            }
        }
    }

    /// Removes dropped connections, returning their ids and reasons.
    pub fn reap_dropped(&mut self) -> Vec<(ConnectionId, String)> {
        let dropped: Vec<ConnectionId> = self
            .conns
            .values()
            .filter(|c| c.is_dropped())
            .map(|c| c.id)
            .collect();
        dropped
            .into_iter()
            .filter_map(|id| {
                self.conns.remove(&id).map(|c| {
                    let reason = c.drop_reason().unwrap_or_default().to_string();
                    (id, reason)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        protocol::{ClientStatus, Ping},
        transport::loopback_pair,
    };

    fn ping(frame: i64) -> Message {
        Message::Ping(Ping {
            sent_at_micros: 0,
            frame,
        })
    }

    #[test]
    fn per_kind_queues_keep_send_order() {
        let cfg = NetConfig::default();
        let now = Instant::now();
        let (a, b) = loopback_pair();
        let mut tx = Connection::new(ConnectionId(1), ConnectionRole::Server, a, &cfg, now);
        let mut rx = Connection::new(ConnectionId(1), ConnectionRole::ClientSlot, b, &cfg, now);

        tx.send(&ping(1)).unwrap();
        tx.send(&Message::ClientStatus(ClientStatus::default())).unwrap();
        tx.send(&ping(2)).unwrap();
        assert_eq!(rx.pump(), 3);
        assert_eq!(rx.queued(MessageKind::Ping), 2);
        assert_eq!(rx.dequeue(MessageKind::Ping), Some(ping(1)));
        assert_eq!(rx.dequeue(MessageKind::Ping), Some(ping(2)));
        assert!(rx.dequeue(MessageKind::Ping).is_none());
        assert!(rx.dequeue(MessageKind::ClientStatus).is_some());
    }

    #[test]
    fn dropped_connection_refuses_sends_and_discards_queue() {
        let cfg = NetConfig::default();
        let now = Instant::now();
        let (a, b) = loopback_pair();
        let mut tx = Connection::new(ConnectionId(1), ConnectionRole::Server, a, &cfg, now);
        let mut rx = Connection::new(ConnectionId(2), ConnectionRole::ClientSlot, b, &cfg, now);
        tx.send(&ping(1)).unwrap();
        rx.pump();
        rx.drop_with("kicked");
        assert_eq!(rx.queued(MessageKind::Ping), 0);
        assert!(matches!(rx.send(&ping(2)), Err(NetError::ConnectionDropped(ConnectionId(2)))));
        assert_eq!(rx.drop_reason(), Some("kicked"));
        rx.drop_with("second reason");
        assert_eq!(rx.drop_reason(), Some("kicked"));

        // The far side notices the closed link.
        tx.pump();
        assert_eq!(tx.drop_reason(), Some("transport closed"));
    }

    #[test]
    fn handshake_times_out_only_while_connecting() {
        let cfg = NetConfig {
            handshake_timeout_ms: 100,
            ..Default::default()
        };
        let now = Instant::now();
        let mut set = ConnectionSet::new();
        let (a, _a_peer) = loopback_pair();
        let (b, _b_peer) = loopback_pair();
        let slow = set.insert(ConnectionRole::ClientSlot, a, &cfg, now);
        let fast = set.insert(ConnectionRole::ClientSlot, b, &cfg, now);
        set.get_mut(fast).unwrap().establish();

        set.check_handshake_timeouts(now + Duration::from_millis(50));
        assert!(set.reap_dropped().is_empty());

        set.check_handshake_timeouts(now + Duration::from_millis(150));
        let reaped = set.reap_dropped();
        assert_eq!(reaped, vec![(slow, "handshake timed out".to_string())]);
        assert!(set.get(fast).is_some());
        assert_eq!(set.ids_of(SourceClass::AllClients), vec![fast]);
    }

    #[test]
    fn source_classes_select_roles() {
        let cfg = NetConfig::default();
        let now = Instant::now();
        let mut set = ConnectionSet::new();
        let (a, _ap) = loopback_pair();
        let (b, _bp) = loopback_pair();
        let client = set.insert(ConnectionRole::ClientSlot, a, &cfg, now);
        let mgmt = set.insert(ConnectionRole::Management, b, &cfg, now);
        assert_eq!(set.ids_of(SourceClass::AllClients), vec![client]);
        assert_eq!(set.ids_of(SourceClass::Management), vec![mgmt]);
        assert!(set.ids_of(SourceClass::GameServer).is_empty());
    }

    #[test]
    fn undecodable_frames_are_skipped() {
        let cfg = NetConfig::default();
        let now = Instant::now();
        let (mut raw, b) = loopback_pair();
        let mut rx = Connection::new(ConnectionId(1), ConnectionRole::ClientSlot, b, &cfg, now);
        raw.send(crate::transport::Frame {
            channel: crate::transport::Channel::Reliable,
            bytes: bytes::Bytes::from_static(&[0x7f, 0x7f]),
        })
        .unwrap();
        raw.send(ping(3).encode().unwrap()).unwrap();
        assert_eq!(rx.pump(), 1);
        assert!(!rx.is_dropped());
    }
}
