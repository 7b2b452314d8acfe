//! In-process test harness.
//!
//! Wires one [`ArenaServer`] to any number of [`ArenaClient`]s and raw peers
//! over loopback links, and drives them all on a synthetic clock so runs are
//! repeatable.

use std::time::{Duration, Instant};

use arena_client::ArenaClient;
use arena_server::ArenaServer;
use arena_shared::{
    config::NetConfig,
    connection::{Connection, ConnectionId, ConnectionRole},
    event::NetEvent,
    gob::{GobId, GobRegistry, Simulation},
    gobs::{default_registry, Ship},
    protocol::{ClientStatus, Handshake, Message, MessageKind, PROTOCOL_VERSION},
    transport::{loopback_pair, lossy_loopback_pair, Link},
    world::{GobWorld, NewGob},
};

const ALL_KINDS: [MessageKind; 11] = [
    MessageKind::Handshake,
    MessageKind::HandshakeReply,
    MessageKind::ConnectionClosing,
    MessageKind::Ping,
    MessageKind::Pong,
    MessageKind::StartArena,
    MessageKind::ClientStatus,
    MessageKind::EntityCreation,
    MessageKind::EntityUpdate,
    MessageKind::EntityDeletion,
    MessageKind::ClientUpdate,
];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> NetConfig {
    NetConfig {
        tick_hz: 60,
        ..Default::default()
    }
}

/// A hand-driven client end that records everything the server sent it.
pub struct RawPeer {
    /// Id of this peer on the server.
    pub server_side: ConnectionId,
    pub conn: Connection,
    pub received: Vec<Message>,
}

impl RawPeer {
    /// Moves everything delivered so far into `received`.
    pub fn collect(&mut self) {
        self.conn.pump();
        for kind in ALL_KINDS {
            while let Some(msg) = self.conn.dequeue(kind) {
                self.received.push(msg);
            }
        }
    }

    pub fn send(&mut self, msg: Message) -> anyhow::Result<()> {
        self.conn.send(&msg)?;
        Ok(())
    }

    /// Sends a handshake with `canonical_ids` and asks to play.
    pub fn join(&mut self, canonical_ids: Vec<String>) -> anyhow::Result<()> {
        self.send(Message::Handshake(Handshake {
            protocol: PROTOCOL_VERSION,
            canonical_ids,
            handshake_key: 7,
        }))?;
        self.send(Message::ClientStatus(ClientStatus {
            ready_to_start: true,
            requested_spawn_arena_id: None,
        }))
    }

    /// Number of creation messages naming `id`.
    pub fn creations_of(&self, id: GobId) -> usize {
        self.received
            .iter()
            .filter(|m| matches!(m, Message::EntityCreation(c) if c.gobs.iter().any(|g| g.id == id)))
            .count()
    }

    /// Number of update messages naming `id`.
    pub fn updates_of(&self, id: GobId) -> usize {
        self.received
            .iter()
            .filter(|m| matches!(m, Message::EntityUpdate(u) if u.gobs.iter().any(|g| g.id == id)))
            .count()
    }

    /// Number of deletion messages naming `id`.
    pub fn deletions_of(&self, id: GobId) -> usize {
        self.received
            .iter()
            .filter(|m| matches!(m, Message::EntityDeletion(d) if d.ids.contains(&id)))
            .count()
    }
}

/// One server and its peers on a shared synthetic clock.
pub struct Harness {
    pub cfg: NetConfig,
    pub server: ArenaServer,
    pub clients: Vec<ArenaClient>,
    pub peers: Vec<RawPeer>,
    pub server_events: Vec<NetEvent>,
    pub client_events: Vec<Vec<NetEvent>>,
    /// Spawn an owned ship for every client that joins, and remove a
    /// client's gobs when it leaves.
    pub spawn_ships: bool,
    now: Instant,
}

impl Harness {
    /// Harness with a running arena.
    pub fn new(cfg: NetConfig) -> Self {
        let mut server = ArenaServer::new(cfg.clone(), default_registry(), GobWorld::new());
        server.start_arena();
        server.drain_events();
        Self {
            cfg,
            server,
            clients: Vec::new(),
            peers: Vec::new(),
            server_events: Vec::new(),
            client_events: Vec::new(),
            spawn_ships: true,
            now: Instant::now(),
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Moves the synthetic clock without stepping anything.
    pub fn advance_clock(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn add_client(&mut self) -> usize {
        let (server_end, client_end) = loopback_pair();
        self.attach_client(server_end, client_end, default_registry())
    }

    /// Client whose best-effort traffic is dropped at `drop_rate` both ways.
    pub fn add_lossy_client(&mut self, drop_rate: f64, seed: u64) -> usize {
        let (server_end, client_end) = lossy_loopback_pair(drop_rate, seed);
        self.attach_client(server_end, client_end, default_registry())
    }

    pub fn add_client_with_registry(&mut self, registry: GobRegistry) -> usize {
        let (server_end, client_end) = loopback_pair();
        self.attach_client(server_end, client_end, registry)
    }

    fn attach_client(&mut self, server_end: Link, client_end: Link, registry: GobRegistry) -> usize {
        self.server.accept_link(server_end, self.now);
        let mut client = ArenaClient::new(self.cfg.clone(), registry, GobWorld::new());
        // A fresh loopback link always accepts the handshake.
        if let Err(e) = client.attach(client_end, self.now) {
            tracing::warn!(error = %e, "Attach failed");
        }
        self.clients.push(client);
        self.client_events.push(Vec::new());
        self.clients.len() - 1
    }

    /// Adds a raw peer that has not sent anything yet.
    pub fn add_raw_peer(&mut self) -> usize {
        let (server_end, peer_end) = loopback_pair();
        let server_side = self.server.accept_link(server_end, self.now);
        let conn = Connection::new(ConnectionId(0), ConnectionRole::Server, peer_end, &self.cfg, self.now);
        self.peers.push(RawPeer {
            server_side,
            conn,
            received: Vec::new(),
        });
        self.peers.len() - 1
    }

    /// Adds a raw peer that handshakes and asks to play.
    pub fn add_joined_peer(&mut self) -> anyhow::Result<usize> {
        let index = self.add_raw_peer();
        let ids = default_registry().canonical_ids();
        self.peers[index].join(ids)?;
        Ok(index)
    }

    /// One tick: server first, then every client, then raw peers collect.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        self.now += self.cfg.frame_duration();
        self.server.step(self.now)?;
        self.handle_server_events();
        for (client, events) in self.clients.iter_mut().zip(self.client_events.iter_mut()) {
            client.step(self.now)?;
            events.extend(client.drain_events());
        }
        for peer in &mut self.peers {
            peer.collect();
        }
        Ok(())
    }

    pub fn run(&mut self, ticks: u32) -> anyhow::Result<()> {
        for _ in 0..ticks {
            self.tick()?;
        }
        Ok(())
    }

    /// Ticks until `done` holds, for at most `max_ticks`. Returns whether it
    /// held.
    pub fn run_until(&mut self, max_ticks: u32, mut done: impl FnMut(&Harness) -> bool) -> anyhow::Result<bool> {
        for _ in 0..max_ticks {
            if done(self) {
                return Ok(true);
            }
            self.tick()?;
        }
        Ok(done(self))
    }

    /// Server-side id of client `index`, once it completed its handshake.
    pub fn client_id(&self, index: usize) -> Option<ConnectionId> {
        self.clients[index].connection_id()
    }

    /// Gob the server spawned for client `index`.
    pub fn ship_of(&self, index: usize) -> Option<GobId> {
        let id = self.client_id(index)?;
        self.server.world().owned_by(id).into_iter().next()
    }

    fn handle_server_events(&mut self) {
        for event in self.server.drain_events() {
            if self.spawn_ships {
                match &event {
                    NetEvent::ClientReady { connection } => {
                        self.server
                            .world_mut()
                            .spawn(NewGob::new(Box::new(Ship::default())).with_owner(*connection));
                    }
                    NetEvent::Disconnected { connection, .. } => {
                        let world = self.server.world_mut();
                        for id in world.owned_by(*connection) {
                            world.remove(id);
                        }
                    }
                    _ => {}
                }
            }
            self.server_events.push(event);
        }
    }
}
