//! Input handling.
//!
//! A real client samples keyboard and gamepad here. This module only turns
//! sampled button state into [`ControlState`] and builds the per-tick
//! [`ClientUpdate`] that carries controls and client-owned gob data.

use std::collections::BTreeMap;

use arena_shared::{
    clock::FrameNumber,
    connection::ConnectionId,
    gob::{GobId, Simulation},
    protocol::{ActorControl, ClientUpdate, ControlState, GobUpdate, SerializationMode},
};
use bytes::BytesMut;

/// Button state at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputState {
    pub forward: bool,
    pub back: bool,
    pub left: bool,
    pub right: bool,
    pub fire1: bool,
    pub fire2: bool,
    pub extra: bool,
}

impl InputState {
    /// Opposing buttons cancel out.
    pub fn to_controls(self) -> ControlState {
        ControlState {
            thrust: axis(self.forward, self.back),
            turn: axis(self.left, self.right),
            fire1: self.fire1,
            fire2: self.fire2,
            extra: self.extra,
        }
    }
}

fn axis(positive: bool, negative: bool) -> f32 {
    match (positive, negative) {
        (true, false) => 1.0,
        (false, true) => -1.0,
        _ => 0.0,
    }
}

/// Builds the client update for a tick, or `None` if there is nothing to send.
///
/// Only gobs owned by `me` are written; the server would ignore the rest.
pub fn build_client_update<S: Simulation + ?Sized>(
    frame: FrameNumber,
    controls: &BTreeMap<GobId, ControlState>,
    world: &S,
    me: ConnectionId,
) -> Option<ClientUpdate> {
    let controls: Vec<ActorControl> = controls
        .iter()
        .filter(|(actor, _)| world.owner_of(**actor) == Some(Some(me)))
        .map(|(actor, controls)| ActorControl {
            actor: *actor,
            controls: *controls,
        })
        .collect();

    let gobs: Vec<GobUpdate> = world
        .owned_by(me)
        .into_iter()
        .filter_map(|id| {
            let mut data = BytesMut::new();
            world
                .write_gob(id, SerializationMode::CLIENT_UPDATE, &mut data)
                .then(|| GobUpdate {
                    id,
                    data: data.to_vec(),
                })
        })
        .collect();

    if controls.is_empty() && gobs.is_empty() {
        return None;
    }
    Some(ClientUpdate {
        frame,
        controls,
        gobs,
    })
}

#[cfg(test)]
mod tests {
    use arena_shared::{
        gobs::{Bullet, Ship},
        world::{GobWorld, NewGob},
    };

    use super::*;

    #[test]
    fn opposing_buttons_cancel() {
        let input = InputState {
            forward: true,
            back: true,
            left: true,
            fire1: true,
            ..Default::default()
        };
        let controls = input.to_controls();
        assert_eq!(controls.thrust, 0.0);
        assert_eq!(controls.turn, 1.0);
        assert!(controls.fire1);
        assert!(!controls.fire2);
    }

    #[test]
    fn update_carries_only_owned_gobs_and_actors() {
        let me = ConnectionId(3);
        let mut world = GobWorld::new();
        let mine = world.spawn(NewGob::new(Box::new(Ship::default())).with_owner(me));
        let theirs = world.spawn(NewGob::new(Box::new(Ship::default())).with_owner(ConnectionId(4)));
        world.spawn(NewGob::new(Box::new(Bullet::default())));

        let mut controls = BTreeMap::new();
        controls.insert(mine, ControlState { thrust: 1.0, ..Default::default() });
        controls.insert(theirs, ControlState { thrust: 1.0, ..Default::default() });

        let update = build_client_update(7, &controls, &world, me).unwrap();
        assert_eq!(update.frame, 7);
        assert_eq!(update.controls.len(), 1);
        assert_eq!(update.controls[0].actor, mine);
        assert_eq!(update.gobs.len(), 1);
        assert_eq!(update.gobs[0].id, mine);
    }

    #[test]
    fn nothing_owned_means_no_update() {
        let world = GobWorld::new();
        assert!(build_client_update(1, &BTreeMap::new(), &world, ConnectionId(1)).is_none());
    }
}
