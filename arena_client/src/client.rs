//! Client implementation.
//!
//! The client holds exactly one connection, to the server. Each
//! [`ArenaClient::step`]:
//! 1. pumps the server link and expires a stalled handshake;
//! 2. dispatches queued messages to the handlers in [`crate::handlers`];
//! 3. turns a dropped server link into a `Disconnected` event;
//! 4. if an arena is running, applies the clock-sync nudge, steps the
//!    simulation, advances the frame and periodically sends a client update;
//! 5. sends clock-sync pings.
//!
//! Remote gobs are mirrored into the local [`Simulation`]; the client never
//! replicates them onwards.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use arena_shared::{
    clock::{FrameCounter, FrameNumber},
    config::NetConfig,
    connection::{Connection, ConnectionId, ConnectionRole, ConnectionSet, SourceClass},
    dispatch::{DispatchContext, Dispatcher, HandlerId},
    event::{EventQueue, NetEvent},
    gob::{GobId, GobRegistry, Simulation},
    lag::{self, CollisionLedger},
    protocol::{ClientStatus, ConnectionClosing, ControlState, Handshake, Message, MessageKind, PROTOCOL_VERSION},
    transport::{self, Link},
    world::GobWorld,
};
use tracing::{debug, info};

use crate::{handlers, input::build_client_update};

/// Everything handlers and the tick loop operate on.
pub struct ClientContext<S: Simulation = GobWorld> {
    pub cfg: NetConfig,
    pub connections: ConnectionSet,
    pub world: S,
    pub registry: GobRegistry,
    pub events: EventQueue,
    pub ledger: CollisionLedger,
    /// Local id of the server link.
    pub server: Option<ConnectionId>,
    /// Id the server assigned to us in its handshake reply.
    pub connection_id: Option<ConnectionId>,
    pub arena_id: u32,
    pub frame: FrameCounter,
    pub running: bool,
    /// Controls sent for owned actors with every client update.
    pub controls: BTreeMap<GobId, ControlState>,
    pub now: Instant,
    ticks: u64,
}

impl<S: Simulation> DispatchContext for ClientContext<S> {
    fn connections(&mut self) -> &mut ConnectionSet {
        &mut self.connections
    }
}

impl<S: Simulation> ClientContext<S> {
    pub fn new(cfg: NetConfig, registry: GobRegistry, world: S) -> Self {
        Self {
            cfg,
            connections: ConnectionSet::new(),
            world,
            registry,
            events: EventQueue::default(),
            ledger: CollisionLedger::new(),
            server: None,
            connection_id: None,
            arena_id: 0,
            frame: FrameCounter::default(),
            running: false,
            controls: BTreeMap::new(),
            now: Instant::now(),
            ticks: 0,
        }
    }

    /// Sends to the server. Failures only mark the link dropped.
    pub fn send_to_server(&mut self, msg: &Message) {
        let Some(id) = self.server else {
            return;
        };
        if let Err(e) = self.connections.send(id, msg) {
            debug!(kind = ?msg.kind(), error = %e, "Send to server failed");
        }
    }

    /// Whole frames between the server producing `sender_frame` and now.
    pub fn frames_ago(&self, from: ConnectionId, sender_frame: FrameNumber) -> u32 {
        let offset = self
            .connections
            .get(from)
            .map_or(0, |c| c.clock().frame_offset());
        lag::frames_ago(sender_frame, offset, self.frame.get())
    }

    /// True for gobs this client owns and therefore predicts locally.
    pub fn is_own(&self, id: GobId) -> bool {
        match self.connection_id {
            Some(me) => self.world.owner_of(id) == Some(Some(me)),
            None => false,
        }
    }
}

/// Game client.
pub struct ArenaClient<S: Simulation + 'static = GobWorld> {
    ctx: ClientContext<S>,
    dispatcher: Dispatcher<ClientContext<S>>,
    /// Pending single-shot handshake reply handler.
    handshake_reply: Option<HandlerId>,
}

impl<S: Simulation + 'static> ArenaClient<S> {
    /// Creates a client with no server link yet.
    pub fn new(cfg: NetConfig, registry: GobRegistry, world: S) -> Self {
        let mut dispatcher = Dispatcher::new();
        handlers::install(&mut dispatcher);
        Self {
            ctx: ClientContext::new(cfg, registry, world),
            dispatcher,
            handshake_reply: None,
        }
    }

    /// Connects to `cfg.server_addr` over sockets and starts the handshake.
    pub async fn connect(cfg: NetConfig, registry: GobRegistry, world: S) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %addr, "Connecting to server");
        let link = transport::connect(addr).await?;
        let mut client = Self::new(cfg, registry, world);
        client.attach(link, Instant::now())?;
        Ok(client)
    }

    /// Uses `link` as the server connection and sends the handshake.
    ///
    /// The handshake reply is served by a single-shot handler that is gone
    /// once the reply has been handled.
    pub fn attach(&mut self, link: Link, now: Instant) -> anyhow::Result<ConnectionId> {
        if let Some(existing) = self.ctx.server {
            bail!("already attached to a server as {existing:?}");
        }
        let ctx = &mut self.ctx;
        ctx.now = now;
        let id = ctx.connections.insert(ConnectionRole::Server, link, &ctx.cfg, now);
        ctx.server = Some(id);

        let handshake = Message::Handshake(Handshake {
            protocol: PROTOCOL_VERSION,
            canonical_ids: ctx.registry.canonical_ids(),
            handshake_key: rand::random(),
        });
        ctx.connections
            .send(id, &handshake)
            .context("send handshake")?;
        // A reply that never came for an earlier link must not fire now.
        if let Some(stale) = self.handshake_reply.take() {
            self.dispatcher.deregister(stale);
        }
        self.handshake_reply = Some(self.dispatcher.register_once(
            MessageKind::HandshakeReply,
            SourceClass::GameServer,
            handlers::on_handshake_reply::<S>,
        ));
        debug!(connection = ?id, "Handshake sent");
        Ok(id)
    }

    /// Tells the server why, then drops the link. The `Disconnected` event
    /// follows on the next step.
    pub fn disconnect(&mut self, reason: &str) {
        self.ctx.send_to_server(&Message::ConnectionClosing(ConnectionClosing {
            reason: reason.to_string(),
            mismatch_index: None,
        }));
        if let Some(conn) = self.server_connection_mut() {
            conn.drop_with(reason);
        }
    }

    /// Asks the server to (re)spawn us, optionally into a specific arena.
    pub fn send_status(&mut self, status: ClientStatus) {
        self.ctx.send_to_server(&Message::ClientStatus(status));
    }

    /// Sets the controls sent for `actor` from now on.
    pub fn set_controls(&mut self, actor: GobId, controls: ControlState) {
        self.ctx.controls.insert(actor, controls);
    }

    pub fn clear_controls(&mut self, actor: GobId) {
        self.ctx.controls.remove(&actor);
    }

    pub fn context(&self) -> &ClientContext<S> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ClientContext<S> {
        &mut self.ctx
    }

    pub fn world(&self) -> &S {
        &self.ctx.world
    }

    pub fn world_mut(&mut self) -> &mut S {
        &mut self.ctx.world
    }

    pub fn frame(&self) -> FrameNumber {
        self.ctx.frame.get()
    }

    pub fn arena_id(&self) -> u32 {
        self.ctx.arena_id
    }

    /// Server-assigned id, once the handshake completed.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.ctx.connection_id
    }

    pub fn is_connected(&self) -> bool {
        self.server_connection().is_some_and(|c| c.is_established())
    }

    pub fn is_running(&self) -> bool {
        self.ctx.running
    }

    pub fn server_connection(&self) -> Option<&Connection> {
        self.ctx.server.and_then(|id| self.ctx.connections.get(id))
    }

    fn server_connection_mut(&mut self) -> Option<&mut Connection> {
        let id = self.ctx.server?;
        self.ctx.connections.get_mut(id)
    }

    /// Gobs owned by this client.
    pub fn own_gobs(&self) -> Vec<GobId> {
        match self.ctx.connection_id {
            Some(me) => self.ctx.world.owned_by(me),
            None => Vec::new(),
        }
    }

    /// Drains pending events.
    pub fn drain_events(&mut self) -> Vec<NetEvent> {
        self.ctx.events.drain()
    }

    /// Runs the client for a number of ticks.
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

    /// Executes one fixed client step.
    pub fn step(&mut self, now: Instant) -> anyhow::Result<()> {
        self.ctx.now = now;
        self.ctx.connections.pump_all();
        self.ctx.connections.check_handshake_timeouts(now);
        self.dispatcher.dispatch(&mut self.ctx);
        self.reap();

        if self.ctx.running {
            self.advance(now);
        }
        self.send_ping();
        Ok(())
    }

    fn reap(&mut self) {
        for (id, reason) in self.ctx.connections.reap_dropped() {
            let ctx = &mut self.ctx;
            if ctx.server == Some(id) {
                ctx.server = None;
                ctx.running = false;
                ctx.ledger.forget(id);
            }
            let connection = ctx.connection_id.take().unwrap_or(id);
            info!(connection = ?connection, reason = %reason, "Disconnected from server");
            ctx.events.push(NetEvent::Disconnected { connection, reason });
        }
    }

    fn advance(&mut self, now: Instant) {
        let ctx = &mut self.ctx;
        if let Some(conn) = ctx.server.and_then(|id| ctx.connections.get_mut(id)) {
            let correction = conn.clock_mut().nudge(now);
            if correction != 0 {
                debug!(correction, stalled = ctx.frame.stalled_ticks(), "Frame nudged");
                ctx.frame.apply(correction);
            }
        }
        ctx.world.step();
        ctx.frame.advance();
        ctx.ticks += 1;

        let cadence = u64::from(ctx.cfg.client_update_cadence_ticks.max(1));
        if ctx.ticks % cadence != 0 {
            return;
        }
        let Some(me) = ctx.connection_id else {
            return;
        };
        if let Some(update) = build_client_update(ctx.frame.get(), &ctx.controls, &ctx.world, me) {
            ctx.send_to_server(&Message::ClientUpdate(update));
        }
    }

    fn send_ping(&mut self) {
        let (now, frame) = (self.ctx.now, self.ctx.frame.get());
        let Some(conn) = self.server_connection_mut() else {
            return;
        };
        if !conn.is_established() || !conn.clock().should_ping(now) {
            return;
        }
        let ping = conn.clock_mut().make_ping(now, frame);
        if let Err(e) = conn.send(&Message::Ping(ping)) {
            debug!(error = %e, "Ping failed");
        }
    }
}

/// Waits until the client reports a connected server, stepping it meanwhile.
pub async fn wait_connected<S: Simulation + 'static>(client: &mut ArenaClient<S>, timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let dt = client.context().cfg.frame_duration();
    while !client.is_connected() {
        if client.server_connection().is_none() {
            bail!("server link dropped before handshake completed");
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("handshake did not complete within {timeout:?}");
        }
        client.step(Instant::now())?;
        tokio::time::sleep(dt).await;
    }
    Ok(())
}
