//! Entity replication engine.
//!
//! Decides, per tick and per client, which gobs to announce, update or
//! retire. It exclusively owns the per-connection announced sets and the
//! per-gob last-update timestamps; nothing else mutates them.
//!
//! Pass order within a tick is retire, update, announce. A gob announced this
//! tick is therefore never updated in the same tick, and an update never
//! names a gob whose creation the connection has not been sent.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use arena_shared::{
    clock::FrameNumber,
    config::NetConfig,
    connection::ConnectionId,
    gob::{GobId, MoveType, Simulation},
    protocol::{
        CollisionEvent, EntityCreation, EntityDeletion, EntityUpdate, GobCreation, GobUpdate,
        Message, SerializationMode,
    },
};
use bytes::BytesMut;
use tracing::{debug, trace};

pub struct ReplicationEngine {
    announce_cap: usize,
    update_cadence: u64,
    deletion_cadence: u64,
    tick: u64,
    arena_id: u32,
    announced: HashMap<ConnectionId, HashSet<GobId>>,
    /// Simulation time of the last update sent, set when first announced.
    last_update: HashMap<GobId, Duration>,
    pending_deletions: Vec<GobId>,
    /// Removed ids whose deletion has not been flushed yet. The allocator
    /// never reuses ids, so a flushed id needs no tracking.
    retired: HashSet<GobId>,
}

impl ReplicationEngine {
    pub fn new(cfg: &NetConfig) -> Self {
        Self {
            announce_cap: cfg.announce_batch_cap.max(1),
            update_cadence: u64::from(cfg.update_cadence_ticks.max(1)),
            deletion_cadence: u64::from(cfg.deletion_cadence_ticks.max(1)),
            tick: 0,
            arena_id: 0,
            announced: HashMap::new(),
            last_update: HashMap::new(),
            pending_deletions: Vec::new(),
            retired: HashSet::new(),
        }
    }

    /// Forgets everything about the previous arena instance. Registered
    /// connections stay registered with empty announced sets.
    pub fn reset_arena(&mut self, arena_id: u32) {
        self.arena_id = arena_id;
        self.tick = 0;
        for set in self.announced.values_mut() {
            set.clear();
        }
        self.last_update.clear();
        self.pending_deletions.clear();
        self.retired.clear();
    }

    pub fn arena_id(&self) -> u32 {
        self.arena_id
    }

    /// Starts replicating to a connection.
    pub fn add_connection(&mut self, id: ConnectionId) {
        self.announced.entry(id).or_default();
    }

    /// Drops all bookkeeping for a connection.
    pub fn forget_connection(&mut self, id: ConnectionId) {
        if self.announced.remove(&id).is_some() {
            debug!(connection = ?id, "Removed from replication");
        }
    }

    pub fn is_replicating_to(&self, id: ConnectionId) -> bool {
        self.announced.contains_key(&id)
    }

    pub fn announced_to(&self, id: ConnectionId) -> Option<&HashSet<GobId>> {
        self.announced.get(&id)
    }

    pub fn pending_deletions(&self) -> &[GobId] {
        &self.pending_deletions
    }

    /// Removed gobs still waiting for their deletion flush.
    pub fn retiring(&self) -> usize {
        self.retired.len()
    }

    fn targets(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.announced.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Runs one replication tick and returns the messages to send.
    ///
    /// `now` is simulation time; update periods are measured against it.
    pub fn run_tick(
        &mut self,
        sim: &mut dyn Simulation,
        frame: FrameNumber,
        now: Duration,
    ) -> Vec<(ConnectionId, Message)> {
        let targets = self.targets();
        let mut out = Vec::new();

        self.retire(sim, frame, &targets, &mut out);
        if self.tick % self.update_cadence == 0 {
            self.update(sim, frame, now, &targets, &mut out);
        }
        self.announce(sim, frame, now, &targets, &mut out);

        self.tick += 1;
        out
    }

    fn retire(
        &mut self,
        sim: &mut dyn Simulation,
        frame: FrameNumber,
        targets: &[ConnectionId],
        out: &mut Vec<(ConnectionId, Message)>,
    ) {
        for id in sim.drain_removed() {
            if self.retired.insert(id) {
                self.last_update.remove(&id);
                self.pending_deletions.push(id);
            }
        }
        if self.pending_deletions.is_empty() || self.tick % self.deletion_cadence != 0 {
            return;
        }

        for conn in targets {
            let Some(set) = self.announced.get_mut(conn) else {
                continue;
            };
            let ids: Vec<GobId> = self
                .pending_deletions
                .iter()
                .copied()
                .filter(|id| set.remove(id))
                .collect();
            if !ids.is_empty() {
                trace!(connection = ?conn, count = ids.len(), "Flushing deletions");
                out.push((*conn, Message::EntityDeletion(EntityDeletion { frame, ids })));
            }
        }
        for id in self.pending_deletions.drain(..) {
            self.retired.remove(&id);
        }
    }

    fn update(
        &mut self,
        sim: &mut dyn Simulation,
        frame: FrameNumber,
        now: Duration,
        targets: &[ConnectionId],
        out: &mut Vec<(ConnectionId, Message)>,
    ) {
        let collisions = sim.drain_collisions();

        let mut due: Vec<GobUpdate> = Vec::new();
        for view in sim.relevant_gobs() {
            if view.move_type == MoveType::Static {
                continue;
            }
            // Not announced anywhere yet.
            let Some(last) = self.last_update.get(&view.id).copied() else {
                continue;
            };
            if !view.force_resend && now.saturating_sub(last) < view.update_period {
                continue;
            }
            let mut data = BytesMut::new();
            if !sim.write_gob(view.id, SerializationMode::SERVER_UPDATE, &mut data) {
                continue;
            }
            due.push(GobUpdate {
                id: view.id,
                data: data.to_vec(),
            });
            self.last_update.insert(view.id, now);
            if view.force_resend {
                sim.clear_force_resend(view.id);
            }
        }

        for conn in targets {
            let Some(set) = self.announced.get(conn) else {
                continue;
            };
            let gobs: Vec<GobUpdate> = due.iter().filter(|g| set.contains(&g.id)).cloned().collect();
            let events: Vec<CollisionEvent> = collisions
                .iter()
                .filter(|e| set.contains(&e.gob1) && set.contains(&e.gob2))
                .copied()
                .collect();
            out.push((
                *conn,
                Message::EntityUpdate(EntityUpdate {
                    frame,
                    gobs,
                    collisions: Some(events),
                }),
            ));
        }
    }

    fn announce(
        &mut self,
        sim: &mut dyn Simulation,
        frame: FrameNumber,
        now: Duration,
        targets: &[ConnectionId],
        out: &mut Vec<(ConnectionId, Message)>,
    ) {
        let relevant = sim.relevant_gobs();
        let mut snapshots: HashMap<GobId, Vec<u8>> = HashMap::new();

        for conn in targets {
            let Some(set) = self.announced.get_mut(conn) else {
                continue;
            };
            let mut gobs = Vec::new();
            for view in &relevant {
                if gobs.len() >= self.announce_cap {
                    break;
                }
                if set.contains(&view.id) || self.retired.contains(&view.id) {
                    continue;
                }
                let data = match snapshots.get(&view.id) {
                    Some(data) => data.clone(),
                    None => {
                        let mut buf = BytesMut::new();
                        if !sim.write_gob(view.id, SerializationMode::SERVER_CREATION, &mut buf) {
                            continue;
                        }
                        let data = buf.to_vec();
                        snapshots.insert(view.id, data.clone());
                        data
                    }
                };
                gobs.push(GobCreation {
                    id: view.id,
                    type_name: view.type_name.to_string(),
                    layer: view.layer,
                    owner: view.owner,
                    data,
                });
            }
            if gobs.is_empty() {
                continue;
            }
            for gob in &gobs {
                set.insert(gob.id);
                self.last_update.entry(gob.id).or_insert(now);
            }
            trace!(connection = ?conn, count = gobs.len(), "Announcing gobs");
            out.push((
                *conn,
                Message::EntityCreation(EntityCreation {
                    arena_id: self.arena_id,
                    frame,
                    gobs,
                }),
            ));
        }
    }
}
