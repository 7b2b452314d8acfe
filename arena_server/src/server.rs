//! Server implementation.
//!
//! An authoritative fixed-step loop. Each [`ArenaServer::step`]:
//! 1. pumps every connection's link into its per-kind queues;
//! 2. expires stalled handshakes;
//! 3. dispatches queued messages to the handlers in [`crate::handlers`];
//! 4. reaps dropped connections out of replication;
//! 5. sends clock-sync pings;
//! 6. if an arena is running, steps the simulation and runs one replication
//!    tick.
//!
//! Determinism notes:
//! - Connections and gobs are iterated in id order.
//! - Replication periods are measured in simulation time (frame * tick),
//!   never wall-clock time.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use anyhow::Context;
use arena_shared::{
    clock::FrameNumber,
    config::NetConfig,
    connection::{ConnectionId, ConnectionRole, ConnectionSet, SourceClass},
    dispatch::{DispatchContext, Dispatcher},
    event::{EventQueue, NetEvent},
    gob::{GobRegistry, Simulation},
    protocol::{Message, StartArena},
    transport::{Link, NetListener},
    world::GobWorld,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{handlers, replication::ReplicationEngine};

/// Snapshot of server state for the `status` console command.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub arena_id: u32,
    pub frame: FrameNumber,
    pub running: bool,
    pub clients: Vec<ClientReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientReport {
    pub connection: u32,
    pub state: String,
    pub playing_arena: bool,
    pub rtt_ms: Option<f64>,
    pub frame_offset: FrameNumber,
    pub announced: usize,
}

/// Everything handlers and the tick loop operate on.
pub struct ServerContext<S: Simulation = GobWorld> {
    pub cfg: NetConfig,
    pub connections: ConnectionSet,
    pub world: S,
    pub registry: GobRegistry,
    pub replication: ReplicationEngine,
    pub events: EventQueue,
    pub arena_id: u32,
    pub frame: FrameNumber,
    pub running: bool,
    /// Wall clock of the current step, used for RTT measurement only.
    pub now: Instant,
}

impl<S: Simulation> DispatchContext for ServerContext<S> {
    fn connections(&mut self) -> &mut ConnectionSet {
        &mut self.connections
    }
}

impl<S: Simulation> ServerContext<S> {
    pub fn new(cfg: NetConfig, registry: GobRegistry, world: S) -> Self {
        let replication = ReplicationEngine::new(&cfg);
        Self {
            cfg,
            connections: ConnectionSet::new(),
            world,
            registry,
            replication,
            events: EventQueue::default(),
            arena_id: 0,
            frame: 0,
            running: false,
            now: Instant::now(),
        }
    }

    /// Simulation time at the current frame.
    pub fn sim_time(&self) -> Duration {
        self.cfg.frame_duration() * self.frame.clamp(0, u32::MAX as FrameNumber) as u32
    }

    /// Sends to one connection. A failed send only affects that connection.
    pub fn send_to(&mut self, id: ConnectionId, msg: &Message) {
        if let Err(e) = self.connections.send(id, msg) {
            debug!(connection = ?id, kind = ?msg.kind(), error = %e, "Send failed");
        }
    }

    /// Puts an established client into the running arena: tells it which
    /// arena is live and starts replicating to it.
    pub fn join_arena(&mut self, id: ConnectionId) {
        if !self.running || self.replication.is_replicating_to(id) {
            return;
        }
        let start = Message::StartArena(StartArena {
            arena_id: self.arena_id,
            frame: self.frame,
        });
        self.send_to(id, &start);
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        conn.status.playing_arena = true;
        // The client's counter jumps to our frame on StartArena.
        conn.clock_mut().reset_offset(self.now);
        self.replication.add_connection(id);
        self.events.push(NetEvent::ClientReady { connection: id });
        info!(connection = ?id, arena_id = self.arena_id, "Client joined arena");
    }
}

/// Game server.
pub struct ArenaServer<S: Simulation + 'static = GobWorld> {
    ctx: ServerContext<S>,
    dispatcher: Dispatcher<ServerContext<S>>,
    listener: Option<NetListener>,
}

impl<S: Simulation + 'static> ArenaServer<S> {
    /// Creates a server without a socket listener; links are attached with
    /// [`ArenaServer::accept_link`].
    pub fn new(cfg: NetConfig, registry: GobRegistry, world: S) -> Self {
        let mut dispatcher = Dispatcher::new();
        handlers::install(&mut dispatcher);
        Self {
            ctx: ServerContext::new(cfg, registry, world),
            dispatcher,
            listener: None,
        }
    }

    /// Creates a server listening on `cfg.server_addr`.
    pub async fn bind(cfg: NetConfig, registry: GobRegistry, world: S) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = NetListener::bind(addr).await?;
        let mut server = Self::new(cfg, registry, world);
        server.listener = Some(listener);
        Ok(server)
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .as_ref()
            .context("server has no listener")?
            .local_addr()
    }

    /// Accepts a client with timeout (non-blocking).
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<ConnectionId>> {
        let Some(listener) = &self.listener else {
            return Ok(None);
        };
        match tokio::time::timeout(timeout, listener.accept()).await {
            Ok(Ok((link, peer))) => {
                let id = self.accept_link(link, Instant::now());
                info!(connection = ?id, %peer, "Client stream accepted");
                Ok(Some(id))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Adds a client slot for an already established link. The slot stays
    /// Connecting until its handshake arrives.
    pub fn accept_link(&mut self, link: Link, now: Instant) -> ConnectionId {
        let id = self
            .ctx
            .connections
            .insert(ConnectionRole::ClientSlot, link, &self.ctx.cfg, now);
        debug!(connection = ?id, "Client slot created");
        id
    }

    /// Starts a new arena instance and moves every established client into
    /// it.
    pub fn start_arena(&mut self) -> u32 {
        let ctx = &mut self.ctx;
        ctx.arena_id += 1;
        ctx.frame = 0;
        ctx.running = true;
        ctx.world.clear();
        ctx.replication.reset_arena(ctx.arena_id);
        for id in ctx.replication_candidates() {
            ctx.replication.forget_connection(id);
            ctx.join_arena(id);
        }
        ctx.events.push(NetEvent::ArenaStarted {
            arena_id: ctx.arena_id,
        });
        info!(arena_id = ctx.arena_id, "Arena started");
        ctx.arena_id
    }

    pub fn context(&self) -> &ServerContext<S> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ServerContext<S> {
        &mut self.ctx
    }

    pub fn world(&self) -> &S {
        &self.ctx.world
    }

    pub fn world_mut(&mut self) -> &mut S {
        &mut self.ctx.world
    }

    pub fn frame(&self) -> FrameNumber {
        self.ctx.frame
    }

    pub fn arena_id(&self) -> u32 {
        self.ctx.arena_id
    }

    pub fn connections(&self) -> &ConnectionSet {
        &self.ctx.connections
    }

    pub fn replication(&self) -> &ReplicationEngine {
        &self.ctx.replication
    }

    /// Drains pending events.
    pub fn drain_events(&mut self) -> Vec<NetEvent> {
        self.ctx.events.drain()
    }

    pub fn status(&self) -> ServerStatus {
        let ctx = &self.ctx;
        ServerStatus {
            arena_id: ctx.arena_id,
            frame: ctx.frame,
            running: ctx.running,
            clients: ctx
                .connections
                .iter()
                .map(|c| ClientReport {
                    connection: c.id().0,
                    state: format!("{:?}", c.state()),
                    playing_arena: c.status.playing_arena,
                    rtt_ms: c.clock().rtt().map(|d| d.as_secs_f64() * 1000.0),
                    frame_offset: c.clock().frame_offset(),
                    announced: ctx.replication.announced_to(c.id()).map_or(0, |s| s.len()),
                })
                .collect(),
        }
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = self.ctx.cfg.frame_duration();
        let mut next = tokio::time::Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step(Instant::now())?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one fixed simulation step.
    pub fn step(&mut self, now: Instant) -> anyhow::Result<()> {
        self.ctx.now = now;
        self.ctx.connections.pump_all();
        self.ctx.connections.check_handshake_timeouts(now);
        self.dispatcher.dispatch(&mut self.ctx);
        self.reap();
        self.send_pings();

        if self.ctx.running {
            self.ctx.world.step();
            self.ctx.frame += 1;
            self.replicate();
        }
        Ok(())
    }

    fn reap(&mut self) {
        for (id, reason) in self.ctx.connections.reap_dropped() {
            self.ctx.replication.forget_connection(id);
            info!(connection = ?id, reason = %reason, "Client disconnected");
            self.ctx.events.push(NetEvent::Disconnected {
                connection: id,
                reason,
            });
        }
    }

    fn send_pings(&mut self) {
        let ctx = &mut self.ctx;
        for id in ctx.connections.ids_of(SourceClass::AllClients) {
            let Some(conn) = ctx.connections.get_mut(id) else {
                continue;
            };
            if !conn.is_established() || !conn.clock().should_ping(ctx.now) {
                continue;
            }
            let ping = conn.clock_mut().make_ping(ctx.now, ctx.frame);
            if let Err(e) = conn.send(&Message::Ping(ping)) {
                debug!(connection = ?id, error = %e, "Ping failed");
            }
        }
    }

    fn replicate(&mut self) {
        let ctx = &mut self.ctx;
        let now = ctx.sim_time();
        let out = ctx.replication.run_tick(&mut ctx.world, ctx.frame, now);
        for (id, msg) in out {
            if let Err(e) = ctx.connections.send(id, &msg) {
                warn!(connection = ?id, kind = ?msg.kind(), error = %e, "Replication send failed");
            }
        }
    }
}

impl<S: Simulation> ServerContext<S> {
    /// Established clients that already asked to play.
    fn replication_candidates(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|c| c.is_established() && c.status.ready_to_start)
            .map(|c| c.id())
            .collect()
    }
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(ArenaServer, NetConfig)> {
    let cfg = NetConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        tick_hz,
        ..Default::default()
    };
    let server = ArenaServer::bind(cfg.clone(), arena_shared::gobs::default_registry(), GobWorld::new()).await?;
    let cfg = NetConfig {
        server_addr: server.local_addr()?.to_string(),
        ..cfg
    };
    Ok((server, cfg))
}
