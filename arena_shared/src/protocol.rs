//! Message protocol.
//!
//! One frame carries one message. A frame starts with a big-endian `u16`
//! header: the low 15 bits are the topic id, the high bit marks a reply
//! (e.g. `Pong` answering `Ping` on the same topic). The rest of the frame is
//! the `serde_json` body of the message.
//!
//! Gob field data inside bodies is opaque: it is whatever
//! [`Gob::write`](crate::gob::Gob::write) produced for the
//! [`SerializationMode`] the sender chose.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    clock::FrameNumber,
    connection::ConnectionId,
    error::NetError,
    gob::GobId,
    transport::{Channel, Frame},
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

const REPLY_BIT: u16 = 0x8000;

bitflags::bitflags! {
    /// Selects which gob fields a write/read touches.
    ///
    /// Two axes: data class (`CONSTANT_DATA` / `VARYING_DATA`) and origin
    /// (`FROM_SERVER` / `FROM_CLIENT`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SerializationMode: u8 {
        const CONSTANT_DATA = 1 << 0;
        const VARYING_DATA = 1 << 1;
        const FROM_SERVER = 1 << 2;
        const FROM_CLIENT = 1 << 3;
    }
}

impl SerializationMode {
    /// Creation snapshot: everything the server knows.
    pub const SERVER_CREATION: Self = Self::CONSTANT_DATA
        .union(Self::VARYING_DATA)
        .union(Self::FROM_SERVER);
    /// Periodic server update.
    pub const SERVER_UPDATE: Self = Self::VARYING_DATA.union(Self::FROM_SERVER);
    /// Client update for a client-owned gob.
    pub const CLIENT_UPDATE: Self = Self::VARYING_DATA.union(Self::FROM_CLIENT);
}

/// Stable topic identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Topic {
    Handshake = 1,
    ConnectionClosing = 2,
    Ping = 3,
    StartArena = 4,
    ClientStatus = 5,
    EntityCreation = 6,
    EntityUpdate = 7,
    EntityDeletion = 8,
    ClientUpdate = 9,
}

impl Topic {
    pub fn from_id(id: u16) -> Option<Self> {
        Some(match id {
            1 => Topic::Handshake,
            2 => Topic::ConnectionClosing,
            3 => Topic::Ping,
            4 => Topic::StartArena,
            5 => Topic::ClientStatus,
            6 => Topic::EntityCreation,
            7 => Topic::EntityUpdate,
            8 => Topic::EntityDeletion,
            9 => Topic::ClientUpdate,
            _ => return None,
        })
    }
}

/// Message type discriminator: a topic plus the reply flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Handshake,
    HandshakeReply,
    ConnectionClosing,
    Ping,
    Pong,
    StartArena,
    ClientStatus,
    EntityCreation,
    EntityUpdate,
    EntityDeletion,
    ClientUpdate,
}

impl MessageKind {
    pub fn topic(self) -> Topic {
        match self {
            MessageKind::Handshake | MessageKind::HandshakeReply => Topic::Handshake,
            MessageKind::ConnectionClosing => Topic::ConnectionClosing,
            MessageKind::Ping | MessageKind::Pong => Topic::Ping,
            MessageKind::StartArena => Topic::StartArena,
            MessageKind::ClientStatus => Topic::ClientStatus,
            MessageKind::EntityCreation => Topic::EntityCreation,
            MessageKind::EntityUpdate => Topic::EntityUpdate,
            MessageKind::EntityDeletion => Topic::EntityDeletion,
            MessageKind::ClientUpdate => Topic::ClientUpdate,
        }
    }

    pub fn is_reply(self) -> bool {
        matches!(self, MessageKind::HandshakeReply | MessageKind::Pong)
    }

    /// Structural messages go reliable; high-frequency state goes best-effort.
    pub fn channel(self) -> Channel {
        match self {
            MessageKind::Ping
            | MessageKind::Pong
            | MessageKind::EntityUpdate
            | MessageKind::ClientUpdate => Channel::BestEffort,
            _ => Channel::Reliable,
        }
    }

    pub fn header(self) -> u16 {
        let id = self.topic() as u16;
        if self.is_reply() {
            id | REPLY_BIT
        } else {
            id
        }
    }

    pub fn from_header(header: u16) -> Result<Self, NetError> {
        let reply = header & REPLY_BIT != 0;
        let topic = Topic::from_id(header & !REPLY_BIT).ok_or(NetError::UnknownTopic(header))?;
        Ok(match (topic, reply) {
            (Topic::Handshake, false) => MessageKind::Handshake,
            (Topic::Handshake, true) => MessageKind::HandshakeReply,
            (Topic::Ping, false) => MessageKind::Ping,
            (Topic::Ping, true) => MessageKind::Pong,
            (_, true) => return Err(NetError::UnknownTopic(header)),
            (Topic::ConnectionClosing, false) => MessageKind::ConnectionClosing,
            (Topic::StartArena, false) => MessageKind::StartArena,
            (Topic::ClientStatus, false) => MessageKind::ClientStatus,
            (Topic::EntityCreation, false) => MessageKind::EntityCreation,
            (Topic::EntityUpdate, false) => MessageKind::EntityUpdate,
            (Topic::EntityDeletion, false) => MessageKind::EntityDeletion,
            (Topic::ClientUpdate, false) => MessageKind::ClientUpdate,
        })
    }
}

/// Client -> server: opens the session and carries the schema table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handshake {
    pub protocol: u32,
    pub canonical_ids: Vec<String>,
    pub handshake_key: u64,
}

/// Server -> client: handshake accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeReply {
    pub connection_id: ConnectionId,
    pub arena_id: u32,
    pub frame: FrameNumber,
}

/// Either side: the sender is about to drop the connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionClosing {
    pub reason: String,
    pub mismatch_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    /// Sender clock, microseconds since its connection epoch.
    pub sent_at_micros: u64,
    pub frame: FrameNumber,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pong {
    pub ping_sent_at_micros: u64,
    /// Responder frame at the time of answering.
    pub frame: FrameNumber,
}

/// Server -> client: a new arena instance starts at `frame`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartArena {
    pub arena_id: u32,
    pub frame: FrameNumber,
}

/// Client -> server: lifecycle status flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClientStatus {
    pub ready_to_start: bool,
    pub requested_spawn_arena_id: Option<u32>,
}

/// One gob in a creation batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GobCreation {
    pub id: GobId,
    pub type_name: String,
    pub layer: u8,
    pub owner: Option<ConnectionId>,
    /// Written with [`SerializationMode::SERVER_CREATION`].
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityCreation {
    pub arena_id: u32,
    pub frame: FrameNumber,
    pub gobs: Vec<GobCreation>,
}

/// Varying data for one gob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GobUpdate {
    pub id: GobId,
    pub data: Vec<u8>,
}

/// One-shot collision between two gobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollisionEvent {
    pub gob1: GobId,
    pub gob2: GobId,
    pub area1: u8,
    pub area2: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityUpdate {
    pub frame: FrameNumber,
    pub gobs: Vec<GobUpdate>,
    /// `Some(vec![])` is a real, empty batch; `None` means no batch was sent.
    pub collisions: Option<Vec<CollisionEvent>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityDeletion {
    pub frame: FrameNumber,
    pub ids: Vec<GobId>,
}

/// Player control state for one actor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ControlState {
    pub thrust: f32,
    pub turn: f32,
    pub fire1: bool,
    pub fire2: bool,
    pub extra: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActorControl {
    pub actor: GobId,
    pub controls: ControlState,
}

/// Client -> server: controls plus varying data of client-owned gobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientUpdate {
    pub frame: FrameNumber,
    pub controls: Vec<ActorControl>,
    pub gobs: Vec<GobUpdate>,
}

/// High-level message envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(Handshake),
    HandshakeReply(HandshakeReply),
    ConnectionClosing(ConnectionClosing),
    Ping(Ping),
    Pong(Pong),
    StartArena(StartArena),
    ClientStatus(ClientStatus),
    EntityCreation(EntityCreation),
    EntityUpdate(EntityUpdate),
    EntityDeletion(EntityDeletion),
    ClientUpdate(ClientUpdate),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Handshake(_) => MessageKind::Handshake,
            Message::HandshakeReply(_) => MessageKind::HandshakeReply,
            Message::ConnectionClosing(_) => MessageKind::ConnectionClosing,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
            Message::StartArena(_) => MessageKind::StartArena,
            Message::ClientStatus(_) => MessageKind::ClientStatus,
            Message::EntityCreation(_) => MessageKind::EntityCreation,
            Message::EntityUpdate(_) => MessageKind::EntityUpdate,
            Message::EntityDeletion(_) => MessageKind::EntityDeletion,
            Message::ClientUpdate(_) => MessageKind::ClientUpdate,
        }
    }

    /// Serializes the message into one frame on its topic's channel.
    pub fn encode(&self) -> Result<Frame, NetError> {
        let body = match self {
            Message::Handshake(m) => serde_json::to_vec(m)?,
            Message::HandshakeReply(m) => serde_json::to_vec(m)?,
            Message::ConnectionClosing(m) => serde_json::to_vec(m)?,
            Message::Ping(m) => serde_json::to_vec(m)?,
            Message::Pong(m) => serde_json::to_vec(m)?,
            Message::StartArena(m) => serde_json::to_vec(m)?,
            Message::ClientStatus(m) => serde_json::to_vec(m)?,
            Message::EntityCreation(m) => serde_json::to_vec(m)?,
            Message::EntityUpdate(m) => serde_json::to_vec(m)?,
            Message::EntityDeletion(m) => serde_json::to_vec(m)?,
            Message::ClientUpdate(m) => serde_json::to_vec(m)?,
        };
        let kind = self.kind();
        let mut buf = BytesMut::with_capacity(2 + body.len());
        buf.put_u16(kind.header());
        buf.extend_from_slice(&body);
        Ok(Frame {
            channel: kind.channel(),
            bytes: buf.freeze(),
        })
    }

    pub fn decode(bytes: &Bytes) -> Result<Self, NetError> {
        if bytes.len() < 2 {
            return Err(NetError::Decode(format!("frame too short: {} bytes", bytes.len())));
        }
        let header = u16::from_be_bytes([bytes[0], bytes[1]]);
        let body = &bytes[2..];
        Ok(match MessageKind::from_header(header)? {
            MessageKind::Handshake => Message::Handshake(body_of(body)?),
            MessageKind::HandshakeReply => Message::HandshakeReply(body_of(body)?),
            MessageKind::ConnectionClosing => Message::ConnectionClosing(body_of(body)?),
            MessageKind::Ping => Message::Ping(body_of(body)?),
            MessageKind::Pong => Message::Pong(body_of(body)?),
            MessageKind::StartArena => Message::StartArena(body_of(body)?),
            MessageKind::ClientStatus => Message::ClientStatus(body_of(body)?),
            MessageKind::EntityCreation => Message::EntityCreation(body_of(body)?),
            MessageKind::EntityUpdate => Message::EntityUpdate(body_of(body)?),
            MessageKind::EntityDeletion => Message::EntityDeletion(body_of(body)?),
            MessageKind::ClientUpdate => Message::ClientUpdate(body_of(body)?),
        })
    }
}

fn body_of<T: DeserializeOwned>(body: &[u8]) -> Result<T, NetError> {
    Ok(serde_json::from_slice(body)?)
}

/// Compares two canonical identifier tables.
///
/// Reports the first index where they differ; a missing entry on either side
/// shows up as `<none>`.
pub fn check_canonical_ids(local: &[String], remote: &[String]) -> Result<(), NetError> {
    let len = local.len().max(remote.len());
    for index in 0..len {
        let l = local.get(index);
        let r = remote.get(index);
        if l != r {
            return Err(NetError::ProtocolMismatch {
                index,
                local: l.cloned().unwrap_or_else(|| "<none>".to_string()),
                remote: r.cloned().unwrap_or_else(|| "<none>".to_string()),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn header_carries_reply_bit() {
        assert_eq!(MessageKind::Ping.header(), 3);
        assert_eq!(MessageKind::Pong.header(), 0x8003);
        assert_eq!(MessageKind::from_header(0x8001).unwrap(), MessageKind::HandshakeReply);
        assert!(matches!(
            MessageKind::from_header(0x8006),
            Err(NetError::UnknownTopic(0x8006))
        ));
        assert!(matches!(
            MessageKind::from_header(42),
            Err(NetError::UnknownTopic(42))
        ));
    }

    #[test]
    fn structural_messages_are_reliable() {
        assert_eq!(MessageKind::EntityCreation.channel(), Channel::Reliable);
        assert_eq!(MessageKind::EntityDeletion.channel(), Channel::Reliable);
        assert_eq!(MessageKind::Handshake.channel(), Channel::Reliable);
        assert_eq!(MessageKind::EntityUpdate.channel(), Channel::BestEffort);
        assert_eq!(MessageKind::ClientUpdate.channel(), Channel::BestEffort);
    }

    #[test]
    fn frame_starts_with_header() {
        let msg = Message::Pong(Pong {
            ping_sent_at_micros: 10,
            frame: 7,
        });
        let frame = msg.encode().unwrap();
        assert_eq!(&frame.bytes[..2], &[0x80, 0x03]);
        assert_eq!(frame.channel, Channel::BestEffort);
        assert_eq!(Message::decode(&frame.bytes).unwrap(), msg);
    }

    #[test]
    fn empty_collision_batch_differs_from_no_batch() {
        let with_empty = Message::EntityUpdate(EntityUpdate {
            frame: 1,
            gobs: vec![],
            collisions: Some(vec![]),
        });
        let without = Message::EntityUpdate(EntityUpdate {
            frame: 1,
            gobs: vec![],
            collisions: None,
        });
        let a = Message::decode(&with_empty.encode().unwrap().bytes).unwrap();
        let b = Message::decode(&without.encode().unwrap().bytes).unwrap();
        assert_eq!(a, with_empty);
        assert_eq!(b, without);
        assert_ne!(a, b);
    }

    #[test]
    fn truncated_frame_is_a_decode_error() {
        let bytes = Bytes::from_static(&[0x00]);
        assert!(matches!(Message::decode(&bytes), Err(NetError::Decode(_))));
        let bytes = Bytes::from_static(&[0x00, 0x06, b'{']);
        assert!(matches!(Message::decode(&bytes), Err(NetError::Decode(_))));
    }

    #[test]
    fn canonical_ids_report_first_mismatch() {
        let local = ids(&["Ship", "Bullet", "Mine", "Rocket", "Wall", "Pod"]);
        let mut remote = local.clone();
        remote[4] = "Bonus".to_string();
        match check_canonical_ids(&local, &remote) {
            Err(NetError::ProtocolMismatch {
                index,
                local,
                remote,
            }) => {
                assert_eq!(index, 4);
                assert_eq!(local, "Wall");
                assert_eq!(remote, "Bonus");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
        assert!(check_canonical_ids(&local, &local).is_ok());
    }

    #[test]
    fn canonical_ids_shorter_table_mismatches() {
        let local = ids(&["Ship", "Bullet"]);
        let remote = ids(&["Ship"]);
        match check_canonical_ids(&local, &remote) {
            Err(NetError::ProtocolMismatch { index, remote, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(remote, "<none>");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn creation_mode_covers_both_data_classes() {
        let mode = SerializationMode::SERVER_CREATION;
        assert!(mode.contains(SerializationMode::CONSTANT_DATA));
        assert!(mode.contains(SerializationMode::VARYING_DATA));
        assert!(mode.contains(SerializationMode::FROM_SERVER));
        assert!(!mode.contains(SerializationMode::FROM_CLIENT));
    }
}
