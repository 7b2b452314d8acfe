//! Client message handlers.
//!
//! Every handler serves [`SourceClass::GameServer`]. Entity messages that
//! race the arena lifecycle (a creation for the previous arena, an update
//! for a gob already deleted) are dropped quietly.

use anyhow::bail;
use arena_shared::{
    clock::ClockSync,
    connection::{ConnectionId, SourceClass},
    dispatch::Dispatcher,
    error::NetError,
    event::NetEvent,
    gob::{GobRecord, MoveType, Simulation},
    lag,
    protocol::{
        ClientStatus, EntityCreation, EntityDeletion, EntityUpdate, HandshakeReply, Message, MessageKind,
        SerializationMode, StartArena,
    },
    world::DEFAULT_UPDATE_PERIOD,
};
use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::client::ClientContext;

pub fn install<S: Simulation + 'static>(dispatcher: &mut Dispatcher<ClientContext<S>>) {
    dispatcher.register(MessageKind::ConnectionClosing, SourceClass::GameServer, on_closing::<S>);
    // Ahead of ping/pong so a pong in the same step is read on the new timeline.
    dispatcher.register(MessageKind::StartArena, SourceClass::GameServer, on_start_arena::<S>);
    dispatcher.register(MessageKind::Ping, SourceClass::GameServer, on_ping::<S>);
    dispatcher.register(MessageKind::Pong, SourceClass::GameServer, on_pong::<S>);
    dispatcher.register(MessageKind::EntityCreation, SourceClass::GameServer, on_entity_creation::<S>);
    dispatcher.register(MessageKind::EntityUpdate, SourceClass::GameServer, on_entity_update::<S>);
    dispatcher.register(MessageKind::EntityDeletion, SourceClass::GameServer, on_entity_deletion::<S>);
}

/// Single-shot: registered by `ArenaClient::attach`.
pub fn on_handshake_reply<S: Simulation>(
    ctx: &mut ClientContext<S>,
    from: ConnectionId,
    msg: Message,
) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::HandshakeReply(HandshakeReply {
        connection_id,
        arena_id,
        frame,
    }) = msg
    else {
        bail!("expected HandshakeReply, got {kind:?}");
    };
    let Some(conn) = ctx.connections.get_mut(from) else {
        return Ok(());
    };
    conn.establish();
    ctx.connection_id = Some(connection_id);
    info!(connection = ?connection_id, arena_id, frame, "Handshake accepted by server");
    ctx.events.push(NetEvent::Connected {
        connection: connection_id,
    });
    ctx.send_to_server(&Message::ClientStatus(ClientStatus {
        ready_to_start: true,
        requested_spawn_arena_id: None,
    }));
    Ok(())
}

fn on_closing<S: Simulation>(ctx: &mut ClientContext<S>, from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::ConnectionClosing(closing) = msg else {
        bail!("expected ConnectionClosing, got {kind:?}");
    };
    let reason = match closing.mismatch_index {
        Some(index) => format!("closed by server: {} (schema entry {index})", closing.reason),
        None => format!("closed by server: {}", closing.reason),
    };
    if let Some(conn) = ctx.connections.get_mut(from) {
        conn.drop_with(reason);
    }
    Ok(())
}

fn on_ping<S: Simulation>(ctx: &mut ClientContext<S>, _from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::Ping(ping) = msg else {
        bail!("expected Ping, got {kind:?}");
    };
    let pong = ClockSync::answer_ping(&ping, ctx.frame.get());
    ctx.send_to_server(&Message::Pong(pong));
    Ok(())
}

fn on_pong<S: Simulation>(ctx: &mut ClientContext<S>, from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::Pong(pong) = msg else {
        bail!("expected Pong, got {kind:?}");
    };
    let (now, frame) = (ctx.now, ctx.frame.get());
    if let Some(conn) = ctx.connections.get_mut(from) {
        conn.clock_mut().on_pong(now, &pong, frame);
        trace!(rtt = ?conn.clock().rtt(), offset = conn.clock().frame_offset(), "Clock sample");
    }
    Ok(())
}

fn on_start_arena<S: Simulation>(ctx: &mut ClientContext<S>, from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::StartArena(StartArena { arena_id, frame }) = msg else {
        bail!("expected StartArena, got {kind:?}");
    };
    ctx.arena_id = arena_id;
    ctx.frame.reset(frame);
    let now = ctx.now;
    if let Some(conn) = ctx.connections.get_mut(from) {
        conn.clock_mut().reset_offset(now);
    }
    ctx.world.clear();
    ctx.ledger.clear();
    ctx.running = true;
    ctx.events.push(NetEvent::ArenaStarted { arena_id });
    info!(arena_id, frame, "Arena started");
    Ok(())
}

fn on_entity_creation<S: Simulation>(ctx: &mut ClientContext<S>, from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::EntityCreation(EntityCreation {
        arena_id,
        frame: sender_frame,
        gobs,
    }) = msg
    else {
        bail!("expected EntityCreation, got {kind:?}");
    };
    if !ctx.running || arena_id != ctx.arena_id {
        debug!(arena_id, current = ctx.arena_id, "Creation for another arena ignored");
        return Ok(());
    }
    let frames_ago = ctx.frames_ago(from, sender_frame);
    let birth_frame = lag::backdated_birth_frame(ctx.frame.get(), frames_ago);

    for gob in gobs {
        let mut body = match ctx.registry.create(&gob.type_name, gob.layer) {
            Ok(body) => body,
            Err(e) => {
                warn!(gob = ?gob.id, error = %e, "Cannot create gob");
                continue;
            }
        };
        let mut input = Bytes::from(gob.data);
        if let Err(e) = body.read(&mut input, SerializationMode::SERVER_CREATION, frames_ago) {
            warn!(gob = ?gob.id, error = %e, "Bad creation data");
            continue;
        }
        // Mirrors are never replicated onwards.
        let record = GobRecord {
            id: gob.id,
            layer: gob.layer,
            owner: gob.owner,
            relevant: false,
            move_type: MoveType::Dynamic,
            update_period: DEFAULT_UPDATE_PERIOD,
            force_resend: false,
            birth_frame,
            body,
        };
        match ctx.world.insert_gob(record) {
            Ok(()) => ctx.events.push(NetEvent::GobCreated { id: gob.id }),
            Err(e @ NetError::DuplicateEntityId(_)) => warn!(error = %e, "Duplicate creation ignored"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn on_entity_update<S: Simulation>(ctx: &mut ClientContext<S>, from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::EntityUpdate(EntityUpdate {
        frame: sender_frame,
        gobs,
        collisions,
    }) = msg
    else {
        bail!("expected EntityUpdate, got {kind:?}");
    };
    if !ctx.running {
        return Ok(());
    }
    let frames_ago = ctx.frames_ago(from, sender_frame);

    for gob in gobs {
        // Locally predicted.
        if ctx.is_own(gob.id) {
            continue;
        }
        match ctx
            .world
            .read_gob(gob.id, &gob.data, SerializationMode::SERVER_UPDATE, frames_ago)
        {
            Ok(true) => {}
            Ok(false) => trace!(gob = ?gob.id, "Update before creation"),
            Err(e) => warn!(gob = ?gob.id, error = %e, "Bad update data"),
        }
    }

    if let Some(batch) = ctx.ledger.accept(from, sender_frame, collisions.as_deref()) {
        ctx.world.apply_collisions(batch);
    }
    Ok(())
}

fn on_entity_deletion<S: Simulation>(ctx: &mut ClientContext<S>, _from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::EntityDeletion(EntityDeletion { ids, .. }) = msg else {
        bail!("expected EntityDeletion, got {kind:?}");
    };
    let known: Vec<_> = ids.iter().copied().filter(|id| ctx.world.contains(*id)).collect();
    ctx.world.delete_gobs(&ids);
    for id in known {
        ctx.events.push(NetEvent::GobRetired { id });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use arena_shared::{
        config::NetConfig,
        connection::{Connection, ConnectionRole},
        gob::{Gob, GobId},
        gobs::{default_registry, Bullet, Ship, BULLET, SHIP},
        protocol::{CollisionEvent, GobCreation, GobUpdate},
        transport::loopback_pair,
        world::GobWorld,
    };
    use bytes::BytesMut;

    use super::*;
    use crate::client::ArenaClient;

    /// A client that completed its handshake and is in arena 1 at frame 100.
    fn joined_client() -> (ArenaClient, Connection) {
        let cfg = NetConfig::default();
        let (ours, theirs) = loopback_pair();
        let mut client = ArenaClient::new(cfg.clone(), default_registry(), GobWorld::new());
        client.attach(ours, Instant::now()).unwrap();
        let mut server = Connection::new(ConnectionId(0), ConnectionRole::ClientSlot, theirs, &cfg, Instant::now());
        server
            .send(&Message::HandshakeReply(HandshakeReply {
                connection_id: ConnectionId(5),
                arena_id: 1,
                frame: 100,
            }))
            .unwrap();
        server
            .send(&Message::StartArena(StartArena { arena_id: 1, frame: 100 }))
            .unwrap();
        client.step(Instant::now()).unwrap();
        client.drain_events();
        (client, server)
    }

    fn data_of(gob: &dyn Gob, mode: SerializationMode) -> Vec<u8> {
        let mut out = BytesMut::new();
        gob.write(&mut out, mode);
        out.to_vec()
    }

    fn bullet_creation(arena_id: u32, frame: i64, id: u32, bullet: &Bullet) -> Message {
        Message::EntityCreation(EntityCreation {
            arena_id,
            frame,
            gobs: vec![GobCreation {
                id: GobId(id),
                type_name: BULLET.to_string(),
                layer: 0,
                owner: None,
                data: data_of(bullet, SerializationMode::SERVER_CREATION),
            }],
        })
    }

    #[test]
    fn creation_is_backdated_by_frame_age() {
        let (mut client, mut server) = joined_client();
        assert_eq!(client.frame(), 101);
        let bullet = Bullet {
            vel: arena_shared::math::Vec2::new(2.0, 0.0),
            ..Default::default()
        };
        // Produced 3 frames before the client's current frame.
        server.send(&bullet_creation(1, 98, 1, &bullet)).unwrap();
        client.step(Instant::now()).unwrap();

        let record = client.world().get(GobId(1)).unwrap();
        assert_eq!(record.birth_frame, 98);
        // Advanced by velocity * frames_ago on read, then by one local step.
        let mirrored = client.world().body::<Bullet>(GobId(1)).unwrap();
        assert_eq!(mirrored.pos.x, 2.0 * 3.0 + 2.0);
        assert_eq!(client.drain_events(), vec![NetEvent::GobCreated { id: GobId(1) }]);
    }

    #[test]
    fn creation_for_old_arena_is_ignored() {
        let (mut client, mut server) = joined_client();
        server.send(&bullet_creation(0, 101, 1, &Bullet::default())).unwrap();
        client.step(Instant::now()).unwrap();
        assert!(client.world().is_empty());
    }

    #[test]
    fn duplicate_creation_keeps_first_gob() {
        let (mut client, mut server) = joined_client();
        let first = Bullet {
            damage: 1.0,
            ..Default::default()
        };
        let second = Bullet {
            damage: 2.0,
            ..Default::default()
        };
        server.send(&bullet_creation(1, 101, 4, &first)).unwrap();
        server.send(&bullet_creation(1, 101, 4, &second)).unwrap();
        client.step(Instant::now()).unwrap();
        assert_eq!(client.world().len(), 1);
        assert_eq!(client.world().body::<Bullet>(GobId(4)).unwrap().damage, 1.0);
    }

    #[test]
    fn updates_skip_own_gobs_and_unknown_ids() {
        let (mut client, mut server) = joined_client();
        let mine = Ship {
            pilot: "me".into(),
            ..Default::default()
        };
        let other = Ship {
            pilot: "other".into(),
            ..Default::default()
        };
        server
            .send(&Message::EntityCreation(EntityCreation {
                arena_id: 1,
                frame: 101,
                gobs: vec![
                    GobCreation {
                        id: GobId(1),
                        type_name: SHIP.into(),
                        layer: 0,
                        owner: Some(ConnectionId(5)),
                        data: data_of(&mine, SerializationMode::SERVER_CREATION),
                    },
                    GobCreation {
                        id: GobId(2),
                        type_name: SHIP.into(),
                        layer: 0,
                        owner: Some(ConnectionId(6)),
                        data: data_of(&other, SerializationMode::SERVER_CREATION),
                    },
                ],
            }))
            .unwrap();
        client.step(Instant::now()).unwrap();

        let moved = Ship {
            pos: arena_shared::math::Vec2::new(30.0, 0.0),
            ..Default::default()
        };
        let data = data_of(&moved, SerializationMode::SERVER_UPDATE);
        let frame = client.frame();
        server
            .send(&Message::EntityUpdate(EntityUpdate {
                frame,
                gobs: vec![
                    GobUpdate { id: GobId(1), data: data.clone() },
                    GobUpdate { id: GobId(2), data: data.clone() },
                    GobUpdate { id: GobId(77), data },
                ],
                collisions: Some(Vec::new()),
            }))
            .unwrap();
        client.step(Instant::now()).unwrap();

        let world = client.world();
        assert!(world.body::<Ship>(GobId(1)).unwrap().pos.x < 1.0);
        assert_eq!(world.body::<Ship>(GobId(2)).unwrap().pos.x, 30.0);
        assert!(!world.contains(GobId(77)));
    }

    #[test]
    fn collision_batch_applies_once_per_sender_frame() {
        let (mut client, mut server) = joined_client();
        let hit = CollisionEvent {
            gob1: GobId(1),
            gob2: GobId(2),
            area1: 0,
            area2: 1,
        };
        let update = Message::EntityUpdate(EntityUpdate {
            frame: 101,
            gobs: Vec::new(),
            collisions: Some(vec![hit]),
        });
        server.send(&update).unwrap();
        server.send(&update).unwrap();
        client.step(Instant::now()).unwrap();
        assert_eq!(client.world().applied_collisions(), &[hit]);
    }

    #[test]
    fn deletion_retires_known_gobs_only() {
        let (mut client, mut server) = joined_client();
        server.send(&bullet_creation(1, 101, 3, &Bullet::default())).unwrap();
        client.step(Instant::now()).unwrap();
        client.drain_events();

        server
            .send(&Message::EntityDeletion(EntityDeletion {
                frame: 102,
                ids: vec![GobId(3), GobId(40)],
            }))
            .unwrap();
        client.step(Instant::now()).unwrap();
        assert!(client.world().is_empty());
        assert_eq!(client.drain_events(), vec![NetEvent::GobRetired { id: GobId(3) }]);
    }

    #[test]
    fn start_arena_clears_mirrors() {
        let (mut client, mut server) = joined_client();
        server.send(&bullet_creation(1, 101, 3, &Bullet::default())).unwrap();
        client.step(Instant::now()).unwrap();
        server
            .send(&Message::StartArena(StartArena { arena_id: 2, frame: 0 }))
            .unwrap();
        client.step(Instant::now()).unwrap();
        assert_eq!(client.arena_id(), 2);
        assert!(client.world().is_empty());
        assert_eq!(client.frame(), 1);
    }

    #[test]
    fn start_arena_discards_offset_sampled_before_it() {
        let cfg = NetConfig::default();
        let (ours, theirs) = loopback_pair();
        let mut client = ArenaClient::new(cfg.clone(), default_registry(), GobWorld::new());
        let t0 = Instant::now();
        client.attach(ours, t0).unwrap();
        let mut server = Connection::new(ConnectionId(0), ConnectionRole::ClientSlot, theirs, &cfg, t0);
        server
            .send(&Message::HandshakeReply(HandshakeReply {
                connection_id: ConnectionId(5),
                arena_id: 1,
                frame: 500,
            }))
            .unwrap();
        // Established, not running: the first ping goes out at local frame 0.
        client.step(t0).unwrap();
        server.pump();
        let Some(Message::Ping(ping)) = server.dequeue(MessageKind::Ping) else {
            panic!("expected ping");
        };
        assert_eq!(ping.frame, 0);

        // The arena is already at frame 500 and the pong for that ping
        // arrives in the same step as StartArena.
        server
            .send(&Message::StartArena(StartArena { arena_id: 1, frame: 500 }))
            .unwrap();
        server.send(&Message::Pong(ClockSync::answer_ping(&ping, 500))).unwrap();
        client.step(t0 + std::time::Duration::from_millis(20)).unwrap();

        assert_eq!(client.frame(), 501);
        let clock = client.server_connection().unwrap().clock();
        assert_eq!(clock.frame_offset(), 0);
        let bullet = Bullet {
            vel: arena_shared::math::Vec2::new(1.0, 0.0),
            ..Default::default()
        };
        server.send(&bullet_creation(1, 500, 1, &bullet)).unwrap();
        client.step(t0 + std::time::Duration::from_millis(40)).unwrap();
        assert_eq!(client.world().get(GobId(1)).unwrap().birth_frame, 500);
    }

    #[test]
    fn mismatch_index_is_kept_in_drop_reason() {
        let (mut client, mut server) = joined_client();
        server
            .send(&Message::ConnectionClosing(arena_shared::protocol::ConnectionClosing {
                reason: "schema differs".into(),
                mismatch_index: Some(1),
            }))
            .unwrap();
        client.step(Instant::now()).unwrap();
        match client.drain_events().as_slice() {
            [NetEvent::Disconnected { connection, reason }] => {
                assert_eq!(*connection, ConnectionId(5));
                assert!(reason.contains("schema entry 1"));
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
    }
}
