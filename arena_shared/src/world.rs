//! Reference gob world.
//!
//! A deliberately small [`Simulation`] implementation: an ordered map of gob
//! records plus the removal and collision queues replication drains. Ids are
//! handed out monotonically and never reused, even across [`GobWorld::clear`].

use std::{collections::BTreeMap, time::Duration};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::{
    clock::FrameNumber,
    connection::ConnectionId,
    error::NetError,
    gob::{Gob, GobId, GobRecord, MoveType, ReplicationView, Simulation},
    protocol::{CollisionEvent, ControlState, SerializationMode},
};

/// Default period between update replications of one gob.
pub const DEFAULT_UPDATE_PERIOD: Duration = Duration::from_millis(100);

/// Spawn parameters for a new gob.
#[derive(Debug)]
pub struct NewGob {
    pub body: Box<dyn Gob>,
    pub layer: u8,
    pub owner: Option<ConnectionId>,
    pub relevant: bool,
    pub move_type: MoveType,
    pub update_period: Duration,
    pub birth_frame: FrameNumber,
}

impl NewGob {
    pub fn new(body: Box<dyn Gob>) -> Self {
        Self {
            body,
            layer: 0,
            owner: None,
            relevant: true,
            move_type: MoveType::Dynamic,
            update_period: DEFAULT_UPDATE_PERIOD,
            birth_frame: 0,
        }
    }

    pub fn with_layer(mut self, layer: u8) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_owner(mut self, owner: ConnectionId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Local-only gob, never replicated.
    pub fn cosmetic(mut self) -> Self {
        self.relevant = false;
        self
    }

    pub fn with_move_type(mut self, move_type: MoveType) -> Self {
        self.move_type = move_type;
        self
    }

    pub fn with_update_period(mut self, period: Duration) -> Self {
        self.update_period = period;
        self
    }

    pub fn born_at(mut self, frame: FrameNumber) -> Self {
        self.birth_frame = frame;
        self
    }
}

#[derive(Default)]
pub struct GobWorld {
    next_id: u32,
    gobs: BTreeMap<GobId, GobRecord>,
    removed: Vec<GobId>,
    collisions: Vec<CollisionEvent>,
    applied_collisions: Vec<CollisionEvent>,
}

impl GobWorld {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Creates a gob with a fresh id.
    pub fn spawn(&mut self, new: NewGob) -> GobId {
        let id = GobId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        self.gobs.insert(
            id,
            GobRecord {
                id,
                layer: new.layer,
                owner: new.owner,
                relevant: new.relevant,
                move_type: new.move_type,
                update_period: new.update_period,
                force_resend: false,
                birth_frame: new.birth_frame,
                body: new.body,
            },
        );
        debug!(gob = ?id, "Spawned gob");
        id
    }

    /// Removes a gob; relevant ones are queued for retirement.
    pub fn remove(&mut self, id: GobId) -> Option<GobRecord> {
        let record = self.gobs.remove(&id)?;
        if record.relevant {
            self.removed.push(id);
        }
        Some(record)
    }

    pub fn get(&self, id: GobId) -> Option<&GobRecord> {
        self.gobs.get(&id)
    }

    pub fn get_mut(&mut self, id: GobId) -> Option<&mut GobRecord> {
        self.gobs.get_mut(&id)
    }

    /// Typed access to a gob body.
    pub fn body<T: Gob + 'static>(&self, id: GobId) -> Option<&T> {
        self.gobs.get(&id)?.body.as_any().downcast_ref::<T>()
    }

    pub fn len(&self) -> usize {
        self.gobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gobs.is_empty()
    }

    pub fn ids(&self) -> Vec<GobId> {
        self.gobs.keys().copied().collect()
    }

    /// Marks a gob to be included in the next update pass regardless of its
    /// update period.
    pub fn force_resend(&mut self, id: GobId) {
        if let Some(record) = self.gobs.get_mut(&id) {
            record.force_resend = true;
        }
    }

    pub fn push_collision(&mut self, event: CollisionEvent) {
        self.collisions.push(event);
    }

    /// Collision events received from the server so far.
    pub fn applied_collisions(&self) -> &[CollisionEvent] {
        &self.applied_collisions
    }
}

impl Simulation for GobWorld {
    fn relevant_gobs(&self) -> Vec<ReplicationView> {
        self.gobs
            .values()
            .filter(|g| g.relevant)
            .map(GobRecord::view)
            .collect()
    }

    fn write_gob(&self, id: GobId, mode: SerializationMode, out: &mut BytesMut) -> bool {
        match self.gobs.get(&id) {
            Some(record) => {
                record.body.write(out, mode);
                true
            }
            None => false,
        }
    }

    fn clear_force_resend(&mut self, id: GobId) {
        if let Some(record) = self.gobs.get_mut(&id) {
            record.force_resend = false;
        }
    }

    fn drain_removed(&mut self) -> Vec<GobId> {
        std::mem::take(&mut self.removed)
    }

    fn drain_collisions(&mut self) -> Vec<CollisionEvent> {
        std::mem::take(&mut self.collisions)
    }

    fn contains(&self, id: GobId) -> bool {
        self.gobs.contains_key(&id)
    }

    fn owner_of(&self, id: GobId) -> Option<Option<ConnectionId>> {
        self.gobs.get(&id).map(|g| g.owner)
    }

    fn owned_by(&self, owner: ConnectionId) -> Vec<GobId> {
        self.gobs
            .values()
            .filter(|g| g.owner == Some(owner))
            .map(|g| g.id)
            .collect()
    }

    fn insert_gob(&mut self, record: GobRecord) -> Result<(), NetError> {
        if self.gobs.contains_key(&record.id) {
            return Err(NetError::DuplicateEntityId(record.id));
        }
        self.next_id = self.next_id.max(record.id.0 + 1);
        self.gobs.insert(record.id, record);
        Ok(())
    }

    fn read_gob(&mut self, id: GobId, data: &[u8], mode: SerializationMode, frames_ago: u32) -> Result<bool, NetError> {
        let Some(record) = self.gobs.get_mut(&id) else {
            trace!(gob = ?id, "Update for unknown gob ignored");
            return Ok(false);
        };
        let mut input = Bytes::copy_from_slice(data);
        record.body.read(&mut input, mode, frames_ago)?;
        Ok(true)
    }

    fn delete_gobs(&mut self, ids: &[GobId]) {
        for id in ids {
            if self.remove(*id).is_none() {
                trace!(gob = ?id, "Deletion for unknown gob ignored");
            }
        }
    }

    fn apply_controls(&mut self, actor: GobId, controls: &ControlState) -> bool {
        match self.gobs.get_mut(&actor) {
            Some(record) => {
                record.body.apply_controls(controls);
                true
            }
            None => false,
        }
    }

    fn apply_collisions(&mut self, events: &[CollisionEvent]) {
        self.applied_collisions.extend_from_slice(events);
    }

    fn step(&mut self) {
        for record in self.gobs.values_mut() {
            if record.move_type != MoveType::Static {
                record.body.step();
            }
        }
    }

    fn clear(&mut self) {
        self.gobs.clear();
        self.removed.clear();
        self.collisions.clear();
        self.applied_collisions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{gobs::Bullet, math::Vec2};

    fn bullet() -> NewGob {
        NewGob::new(Box::new(Bullet::default()))
    }

    #[test]
    fn ids_are_never_reused() {
        let mut world = GobWorld::new();
        let a = world.spawn(bullet());
        world.remove(a);
        world.clear();
        let b = world.spawn(bullet());
        assert!(b > a);
    }

    #[test]
    fn only_relevant_removals_are_reported() {
        let mut world = GobWorld::new();
        let relevant = world.spawn(bullet());
        let cosmetic = world.spawn(bullet().cosmetic());
        assert_eq!(world.relevant_gobs().len(), 1);
        world.remove(relevant);
        world.remove(cosmetic);
        assert_eq!(world.drain_removed(), vec![relevant]);
        assert!(world.drain_removed().is_empty());
    }

    #[test]
    fn duplicate_insert_keeps_existing_gob() {
        let mut world = GobWorld::new();
        let id = world.spawn(NewGob::new(Box::new(Bullet {
            damage: 1.0,
            ..Default::default()
        })));
        let dup = GobRecord {
            id,
            layer: 0,
            owner: None,
            relevant: true,
            move_type: MoveType::Dynamic,
            update_period: DEFAULT_UPDATE_PERIOD,
            force_resend: false,
            birth_frame: 0,
            body: Box::new(Bullet {
                damage: 99.0,
                ..Default::default()
            }),
        };
        assert!(matches!(world.insert_gob(dup), Err(NetError::DuplicateEntityId(d)) if d == id));
        assert_eq!(world.body::<Bullet>(id).unwrap().damage, 1.0);
    }

    #[test]
    fn reads_for_unknown_gobs_are_noops() {
        let mut world = GobWorld::new();
        let id = world.spawn(bullet());
        let before = world.body::<Bullet>(id).unwrap().clone();
        assert!(!world
            .read_gob(GobId(999), &[1, 2, 3], SerializationMode::SERVER_UPDATE, 0)
            .unwrap());
        assert_eq!(world.body::<Bullet>(id).unwrap(), &before);
        world.delete_gobs(&[GobId(999)]);
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn static_gobs_do_not_move() {
        let mut world = GobWorld::new();
        let moving = world.spawn(NewGob::new(Box::new(Bullet {
            vel: Vec2::new(1.0, 0.0),
            ..Default::default()
        })));
        let fixed = world.spawn(
            NewGob::new(Box::new(Bullet {
                vel: Vec2::new(1.0, 0.0),
                ..Default::default()
            }))
            .with_move_type(MoveType::Static),
        );
        world.step();
        assert_eq!(world.body::<Bullet>(moving).unwrap().pos, Vec2::new(1.0, 0.0));
        assert_eq!(world.body::<Bullet>(fixed).unwrap().pos, Vec2::ZERO);
    }
}
