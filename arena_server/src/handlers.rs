//! Server message handlers.
//!
//! All handlers serve [`SourceClass::AllClients`]. Handshake-gated kinds
//! (`ClientStatus`, `ClientUpdate`) ignore connections that have not
//! completed their handshake.

use anyhow::bail;
use arena_shared::{
    clock::ClockSync,
    connection::{ConnectionId, SourceClass},
    dispatch::Dispatcher,
    error::NetError,
    event::NetEvent,
    gob::Simulation,
    lag,
    protocol::{
        check_canonical_ids, ClientStatus, ClientUpdate, ConnectionClosing, Handshake,
        HandshakeReply, Message, MessageKind, SerializationMode, PROTOCOL_VERSION,
    },
};
use tracing::{debug, info, trace, warn};

use crate::server::ServerContext;

pub fn install<S: Simulation + 'static>(dispatcher: &mut Dispatcher<ServerContext<S>>) {
    dispatcher.register(MessageKind::Handshake, SourceClass::AllClients, on_handshake::<S>);
    dispatcher.register(MessageKind::ConnectionClosing, SourceClass::AllClients, on_closing::<S>);
    dispatcher.register(MessageKind::Ping, SourceClass::AllClients, on_ping::<S>);
    dispatcher.register(MessageKind::Pong, SourceClass::AllClients, on_pong::<S>);
    dispatcher.register(MessageKind::ClientStatus, SourceClass::AllClients, on_client_status::<S>);
    dispatcher.register(MessageKind::ClientUpdate, SourceClass::AllClients, on_client_update::<S>);
}

/// Tells the client why, then drops it.
pub fn close_connection<S: Simulation>(
    ctx: &mut ServerContext<S>,
    id: ConnectionId,
    reason: String,
    mismatch_index: Option<usize>,
) {
    ctx.send_to(
        id,
        &Message::ConnectionClosing(ConnectionClosing {
            reason: reason.clone(),
            mismatch_index,
        }),
    );
    if let Some(conn) = ctx.connections.get_mut(id) {
        conn.drop_with(reason);
    }
}

fn is_established<S: Simulation>(ctx: &ServerContext<S>, id: ConnectionId) -> bool {
    ctx.connections.get(id).is_some_and(|c| c.is_established())
}

fn on_handshake<S: Simulation>(ctx: &mut ServerContext<S>, from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::Handshake(Handshake {
        protocol,
        canonical_ids,
        handshake_key,
    }) = msg
    else {
        bail!("expected Handshake, got {kind:?}");
    };

    if is_established(ctx, from) {
        debug!(connection = ?from, "Repeated handshake ignored");
        return Ok(());
    }

    if protocol != PROTOCOL_VERSION {
        let err = NetError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: protocol,
        };
        warn!(connection = ?from, error = %err, "Rejecting client");
        close_connection(ctx, from, err.to_string(), None);
        return Ok(());
    }

    if let Err(err) = check_canonical_ids(&ctx.registry.canonical_ids(), &canonical_ids) {
        let index = match &err {
            NetError::ProtocolMismatch { index, .. } => Some(*index),
            _ => None,
        };
        warn!(connection = ?from, error = %err, "Rejecting client");
        close_connection(ctx, from, err.to_string(), index);
        return Ok(());
    }

    let Some(conn) = ctx.connections.get_mut(from) else {
        return Ok(());
    };
    conn.status.handshake_key = Some(handshake_key);
    conn.establish();
    let reply = Message::HandshakeReply(HandshakeReply {
        connection_id: from,
        arena_id: ctx.arena_id,
        frame: ctx.frame,
    });
    ctx.send_to(from, &reply);
    ctx.events.push(NetEvent::Connected { connection: from });
    info!(connection = ?from, "Handshake accepted");
    Ok(())
}

fn on_closing<S: Simulation>(ctx: &mut ServerContext<S>, from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::ConnectionClosing(closing) = msg else {
        bail!("expected ConnectionClosing, got {kind:?}");
    };
    if let Some(conn) = ctx.connections.get_mut(from) {
        conn.drop_with(format!("client closed: {}", closing.reason));
    }
    Ok(())
}

fn on_ping<S: Simulation>(ctx: &mut ServerContext<S>, from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::Ping(ping) = msg else {
        bail!("expected Ping, got {kind:?}");
    };
    let pong = ClockSync::answer_ping(&ping, ctx.frame);
    ctx.send_to(from, &Message::Pong(pong));
    Ok(())
}

fn on_pong<S: Simulation>(ctx: &mut ServerContext<S>, from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::Pong(pong) = msg else {
        bail!("expected Pong, got {kind:?}");
    };
    let (now, frame) = (ctx.now, ctx.frame);
    if let Some(conn) = ctx.connections.get_mut(from) {
        conn.clock_mut().on_pong(now, &pong, frame);
        trace!(connection = ?from, rtt = ?conn.clock().rtt(), offset = conn.clock().frame_offset(), "Clock sample");
    }
    Ok(())
}

fn on_client_status<S: Simulation>(ctx: &mut ServerContext<S>, from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::ClientStatus(ClientStatus {
        ready_to_start,
        requested_spawn_arena_id,
    }) = msg
    else {
        bail!("expected ClientStatus, got {kind:?}");
    };
    if !is_established(ctx, from) {
        debug!(connection = ?from, "Status before handshake ignored");
        return Ok(());
    }
    if let Some(conn) = ctx.connections.get_mut(from) {
        conn.status.ready_to_start = ready_to_start;
        conn.status.requested_spawn_arena_id = requested_spawn_arena_id;
    }
    if ready_to_start {
        ctx.join_arena(from);
    }
    Ok(())
}

fn on_client_update<S: Simulation>(ctx: &mut ServerContext<S>, from: ConnectionId, msg: Message) -> anyhow::Result<()> {
    let kind = msg.kind();
    let Message::ClientUpdate(ClientUpdate {
        frame: sender_frame,
        controls,
        gobs,
    }) = msg
    else {
        bail!("expected ClientUpdate, got {kind:?}");
    };
    let Some(conn) = ctx.connections.get(from) else {
        return Ok(());
    };
    if !conn.is_established() || !conn.status.playing_arena {
        return Ok(());
    }
    let frames_ago = lag::frames_ago(sender_frame, conn.clock().frame_offset(), ctx.frame);

    for control in controls {
        if ctx.world.owner_of(control.actor) != Some(Some(from)) {
            debug!(connection = ?from, actor = ?control.actor, "Controls for foreign actor ignored");
            continue;
        }
        ctx.world.apply_controls(control.actor, &control.controls);
    }

    for gob in gobs {
        if ctx.world.owner_of(gob.id) != Some(Some(from)) {
            debug!(connection = ?from, gob = ?gob.id, "Update for foreign gob ignored");
            continue;
        }
        if let Err(e) = ctx
            .world
            .read_gob(gob.id, &gob.data, SerializationMode::CLIENT_UPDATE, frames_ago)
        {
            warn!(connection = ?from, gob = ?gob.id, error = %e, "Bad client gob data");
        }
    }
    Ok(())
}
