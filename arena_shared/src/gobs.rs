//! Built-in gob bodies.
//!
//! Two kinds are enough to exercise every serialization path:
//! - [`Ship`]: a player actor. The server owns its health; its owning client
//!   may write position and velocity.
//! - [`Bullet`]: a short-lived projectile with constant damage.
//!
//! Velocities are in units per frame, so lag compensation advances positions
//! by `velocity * frames_ago`.

use std::any::Any;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    error::NetError,
    gob::{get_f32, get_str, get_vec2, put_str, put_vec2, Gob, GobRegistry},
    math::Vec2,
    protocol::{ControlState, SerializationMode},
};

pub const SHIP: &str = "Ship";
pub const BULLET: &str = "Bullet";

const SHIP_ACCELERATION: f32 = 0.05;
const SHIP_TURN_SPEED: f32 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct Ship {
    // Constant data.
    pub pilot: String,
    pub max_speed: f32,
    // Varying data.
    pub pos: Vec2,
    pub vel: Vec2,
    pub rotation: f32,
    /// Written only from the server.
    pub health: f32,
    pub controls: ControlState,
}

impl Default for Ship {
    fn default() -> Self {
        Self {
            pilot: String::new(),
            max_speed: 4.0,
            pos: Vec2::ZERO,
            vel: Vec2::ZERO,
            rotation: 0.0,
            health: 100.0,
            controls: ControlState::default(),
        }
    }
}

impl Gob for Ship {
    fn type_name(&self) -> &'static str {
        SHIP
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn write(&self, out: &mut BytesMut, mode: SerializationMode) {
        if mode.contains(SerializationMode::CONSTANT_DATA) {
            put_str(out, &self.pilot);
            out.put_f32(self.max_speed);
        }
        if mode.contains(SerializationMode::VARYING_DATA) {
            put_vec2(out, self.pos);
            put_vec2(out, self.vel);
            out.put_f32(self.rotation);
            if mode.contains(SerializationMode::FROM_SERVER) {
                out.put_f32(self.health);
            }
        }
    }

    fn read(&mut self, input: &mut Bytes, mode: SerializationMode, frames_ago: u32) -> Result<(), NetError> {
        if mode.contains(SerializationMode::CONSTANT_DATA) {
            self.pilot = get_str(input)?;
            self.max_speed = get_f32(input)?;
        }
        if mode.contains(SerializationMode::VARYING_DATA) {
            let pos = get_vec2(input)?;
            self.vel = get_vec2(input)?;
            self.rotation = get_f32(input)?;
            self.pos = pos + self.vel * frames_ago as f32;
            if mode.contains(SerializationMode::FROM_SERVER) {
                self.health = get_f32(input)?;
            }
        }
        Ok(())
    }

    fn apply_controls(&mut self, controls: &ControlState) {
        self.controls = *controls;
    }

    fn step(&mut self) {
        self.rotation += self.controls.turn * SHIP_TURN_SPEED;
        self.vel += Vec2::from_angle(self.rotation) * (self.controls.thrust * SHIP_ACCELERATION);
        let speed_sq = self.vel.len_sq();
        if speed_sq > self.max_speed * self.max_speed {
            self.vel = self.vel * (self.max_speed / speed_sq.sqrt());
        }
        self.pos += self.vel;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bullet {
    pub damage: f32,
    pub pos: Vec2,
    pub vel: Vec2,
}

impl Default for Bullet {
    fn default() -> Self {
        Self {
            damage: 10.0,
            pos: Vec2::ZERO,
            vel: Vec2::ZERO,
        }
    }
}

impl Gob for Bullet {
    fn type_name(&self) -> &'static str {
        BULLET
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn write(&self, out: &mut BytesMut, mode: SerializationMode) {
        if mode.contains(SerializationMode::CONSTANT_DATA) {
            out.put_f32(self.damage);
        }
        if mode.contains(SerializationMode::VARYING_DATA) {
            put_vec2(out, self.pos);
            put_vec2(out, self.vel);
        }
    }

    fn read(&mut self, input: &mut Bytes, mode: SerializationMode, frames_ago: u32) -> Result<(), NetError> {
        if mode.contains(SerializationMode::CONSTANT_DATA) {
            self.damage = get_f32(input)?;
        }
        if mode.contains(SerializationMode::VARYING_DATA) {
            let pos = get_vec2(input)?;
            self.vel = get_vec2(input)?;
            self.pos = pos + self.vel * frames_ago as f32;
        }
        Ok(())
    }

    fn step(&mut self) {
        self.pos += self.vel;
    }
}

fn new_ship(_layer: u8) -> Box<dyn Gob> {
    Box::new(Ship::default())
}

fn new_bullet(_layer: u8) -> Box<dyn Gob> {
    Box::new(Bullet::default())
}

/// Registry with every built-in gob type.
pub fn default_registry() -> GobRegistry {
    let mut registry = GobRegistry::new();
    registry.register(SHIP, new_ship).register(BULLET, new_bullet);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(gob: &dyn Gob, mode: SerializationMode) -> Bytes {
        let mut out = BytesMut::new();
        gob.write(&mut out, mode);
        out.freeze()
    }

    #[test]
    fn client_origin_never_carries_health() {
        let ship = Ship {
            health: 12.0,
            ..Default::default()
        };
        let server = written(&ship, SerializationMode::SERVER_UPDATE);
        let client = written(&ship, SerializationMode::CLIENT_UPDATE);
        assert_eq!(server.len(), client.len() + 4);

        let mut copy = Ship::default();
        copy.read(&mut client.clone(), SerializationMode::CLIENT_UPDATE, 0).unwrap();
        assert_eq!(copy.health, 100.0);
    }

    #[test]
    fn varying_read_extrapolates_by_frame_age() {
        let bullet = Bullet {
            damage: 3.0,
            pos: Vec2::new(10.0, 0.0),
            vel: Vec2::new(2.0, -1.0),
        };
        let mut data = written(&bullet, SerializationMode::SERVER_UPDATE);
        let mut copy = Bullet::default();
        copy.read(&mut data, SerializationMode::SERVER_UPDATE, 3).unwrap();
        assert_eq!(copy.pos, Vec2::new(16.0, -3.0));
        // Constant data was not part of the update.
        assert_eq!(copy.damage, 10.0);
    }

    #[test]
    fn creation_snapshot_restores_constant_and_varying_fields() {
        let ship = Ship {
            pilot: "Ace".to_string(),
            max_speed: 6.0,
            pos: Vec2::new(1.0, 2.0),
            health: 40.0,
            ..Default::default()
        };
        let mut data = written(&ship, SerializationMode::SERVER_CREATION);
        let registry = default_registry();
        let mut body = registry.create(SHIP, 0).unwrap();
        body.read(&mut data, SerializationMode::SERVER_CREATION, 0).unwrap();
        let mut again = BytesMut::new();
        body.write(&mut again, SerializationMode::SERVER_CREATION);
        assert_eq!(again.freeze(), written(&ship, SerializationMode::SERVER_CREATION));
    }

    #[test]
    fn ship_speed_is_capped() {
        let mut ship = Ship {
            max_speed: 1.0,
            ..Default::default()
        };
        ship.apply_controls(&ControlState {
            thrust: 1.0,
            ..Default::default()
        });
        for _ in 0..100 {
            ship.step();
        }
        assert!(ship.vel.len_sq() <= 1.0 + 1e-4);
    }
}
