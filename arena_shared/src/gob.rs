//! Gob (game object) model.
//!
//! The network core does not simulate anything. It sees gobs through:
//! - the [`Gob`] trait: mode-selected serialization of one object's fields;
//! - the [`Simulation`] trait: the collaborator that owns the live gob set;
//! - the [`GobRegistry`]: type name -> factory, built once at startup, whose
//!   name table doubles as the canonical identifier list checked at
//!   handshake time.

use std::{any::Any, collections::HashMap, fmt, time::Duration};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    clock::FrameNumber,
    connection::ConnectionId,
    error::NetError,
    math::Vec2,
    protocol::{CollisionEvent, ControlState, SerializationMode},
};

/// Gob id, unique within one arena instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GobId(pub u32);

/// Static gobs never move and are never update-replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveType {
    Static,
    Dynamic,
}

/// Replicable state of one game object.
pub trait Gob: Send + fmt::Debug {
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// Writes the fields selected by `mode`. Pure in `(self, mode)`.
    fn write(&self, out: &mut BytesMut, mode: SerializationMode);

    /// Reads the fields selected by `mode`; `frames_ago` says how stale the
    /// data is so time-sensitive fields can be advanced.
    fn read(&mut self, input: &mut Bytes, mode: SerializationMode, frames_ago: u32) -> Result<(), NetError>;

    /// Applies player controls. Only actors react.
    fn apply_controls(&mut self, _controls: &ControlState) {}

    /// One fixed step of trivial kinematics.
    fn step(&mut self) {}
}

/// A gob plus the metadata replication needs.
#[derive(Debug)]
pub struct GobRecord {
    pub id: GobId,
    pub layer: u8,
    pub owner: Option<ConnectionId>,
    pub relevant: bool,
    pub move_type: MoveType,
    pub update_period: Duration,
    pub force_resend: bool,
    /// Synthetic birth frame, backdated by lag compensation on receivers.
    pub birth_frame: FrameNumber,
    pub body: Box<dyn Gob>,
}

impl GobRecord {
    pub fn type_name(&self) -> &'static str {
        self.body.type_name()
    }

    pub fn view(&self) -> ReplicationView {
        ReplicationView {
            id: self.id,
            type_name: self.body.type_name(),
            layer: self.layer,
            owner: self.owner,
            move_type: self.move_type,
            update_period: self.update_period,
            force_resend: self.force_resend,
        }
    }
}

/// What the replication engine reads about a relevant gob.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationView {
    pub id: GobId,
    pub type_name: &'static str,
    pub layer: u8,
    pub owner: Option<ConnectionId>,
    pub move_type: MoveType,
    pub update_period: Duration,
    pub force_resend: bool,
}

/// The simulation collaborator.
///
/// Unknown ids are never an error: reads, deletions and control updates for
/// a gob the simulation no longer has are no-ops.
pub trait Simulation: Send {
    /// Relevant gobs, in ascending id order.
    fn relevant_gobs(&self) -> Vec<ReplicationView>;

    /// Serializes one gob; false if unknown.
    fn write_gob(&self, id: GobId, mode: SerializationMode, out: &mut BytesMut) -> bool;

    fn clear_force_resend(&mut self, id: GobId);

    /// Relevant gobs removed since the last call.
    fn drain_removed(&mut self) -> Vec<GobId>;

    /// Collision events produced since the last call.
    fn drain_collisions(&mut self) -> Vec<CollisionEvent>;

    fn contains(&self, id: GobId) -> bool;

    /// `None` if unknown, `Some(owner)` otherwise.
    fn owner_of(&self, id: GobId) -> Option<Option<ConnectionId>>;

    /// Gobs owned by `owner`, ascending.
    fn owned_by(&self, owner: ConnectionId) -> Vec<GobId>;

    /// Adds a gob built from a creation message.
    fn insert_gob(&mut self, record: GobRecord) -> Result<(), NetError>;

    /// Applies serialized fields; `Ok(false)` if the gob is unknown.
    fn read_gob(&mut self, id: GobId, data: &[u8], mode: SerializationMode, frames_ago: u32) -> Result<bool, NetError>;

    fn delete_gobs(&mut self, ids: &[GobId]);

    /// False if the actor is unknown.
    fn apply_controls(&mut self, actor: GobId, controls: &ControlState) -> bool;

    /// Collision batch received from the server.
    fn apply_collisions(&mut self, events: &[CollisionEvent]);

    /// One fixed simulation step.
    fn step(&mut self);

    /// Drops every gob, e.g. when a new arena starts.
    fn clear(&mut self);
}

/// Builds an empty gob of one type for a layer.
pub type GobFactory = fn(layer: u8) -> Box<dyn Gob>;

/// Type name -> factory map, built once at startup.
#[derive(Default, Clone)]
pub struct GobRegistry {
    factories: HashMap<&'static str, GobFactory>,
    order: Vec<&'static str>,
}

impl GobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type; re-registering a name replaces its factory but keeps
    /// its canonical position.
    pub fn register(&mut self, type_name: &'static str, factory: GobFactory) -> &mut Self {
        if self.factories.insert(type_name, factory).is_none() {
            self.order.push(type_name);
        }
        self
    }

    pub fn create(&self, type_name: &str, layer: u8) -> Result<Box<dyn Gob>, NetError> {
        self.factories
            .get(type_name)
            .map(|factory| factory(layer))
            .ok_or_else(|| NetError::UnknownGobType(type_name.to_string()))
    }

    /// Canonical identifier table in registration order.
    pub fn canonical_ids(&self) -> Vec<String> {
        self.order.iter().map(|s| s.to_string()).collect()
    }
}

impl fmt::Debug for GobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GobRegistry").field("types", &self.order).finish()
    }
}

// Field codec helpers for gob bodies.

fn need(input: &Bytes, n: usize) -> Result<(), NetError> {
    if input.remaining() < n {
        return Err(NetError::Decode(format!(
            "gob payload truncated: need {n} bytes, have {}",
            input.remaining()
        )));
    }
    Ok(())
}

pub fn put_vec2(out: &mut BytesMut, v: Vec2) {
    out.put_f32(v.x);
    out.put_f32(v.y);
}

pub fn get_vec2(input: &mut Bytes) -> Result<Vec2, NetError> {
    need(input, 8)?;
    Ok(Vec2::new(input.get_f32(), input.get_f32()))
}

pub fn get_f32(input: &mut Bytes) -> Result<f32, NetError> {
    need(input, 4)?;
    Ok(input.get_f32())
}

pub fn get_u8(input: &mut Bytes) -> Result<u8, NetError> {
    need(input, 1)?;
    Ok(input.get_u8())
}

pub fn put_str(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

pub fn get_str(input: &mut Bytes) -> Result<String, NetError> {
    need(input, 2)?;
    let len = input.get_u16() as usize;
    need(input, len)?;
    let raw = input.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| NetError::Decode(e.to_string()))
}
