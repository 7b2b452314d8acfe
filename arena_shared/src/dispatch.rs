//! Message dispatch.
//!
//! A handler serves one [`MessageKind`] from one [`SourceClass`]. Once per
//! tick [`Dispatcher::dispatch`] walks the handlers in registration order and,
//! for each matching live connection, drains that kind's queue into the
//! handler (or takes a single message for single-shot handlers, which
//! deregister after their first successful run).
//!
//! Handlers get the explicit context object, never globals. Messages of one
//! kind from one connection arrive in send order; nothing is promised across
//! kinds or connections.

use std::collections::HashSet;

use tracing::{error, warn};

use crate::{
    connection::{ConnectionId, ConnectionSet, SourceClass},
    error::NetError,
    protocol::{Message, MessageKind},
};

/// Access to the connections a dispatcher drains.
pub trait DispatchContext {
    fn connections(&mut self) -> &mut ConnectionSet;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

type Action<Ctx> = Box<dyn FnMut(&mut Ctx, ConnectionId, Message) -> anyhow::Result<()> + Send>;

struct Handler<Ctx> {
    id: HandlerId,
    kind: MessageKind,
    source: SourceClass,
    single_shot: bool,
    /// `None` once disposed.
    action: Option<Action<Ctx>>,
}

pub struct Dispatcher<Ctx> {
    handlers: Vec<Handler<Ctx>>,
    next_id: u64,
}

impl<Ctx> Default for Dispatcher<Ctx> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
            next_id: 1,
        }
    }
}

impl<Ctx: DispatchContext> Dispatcher<Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(
        &mut self,
        kind: MessageKind,
        source: SourceClass,
        single_shot: bool,
        action: Action<Ctx>,
    ) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers.push(Handler {
            id,
            kind,
            source,
            single_shot,
            action: Some(action),
        });
        id
    }

    /// Registers a handler that drains every queued message each tick.
    pub fn register<F>(&mut self, kind: MessageKind, source: SourceClass, action: F) -> HandlerId
    where
        F: FnMut(&mut Ctx, ConnectionId, Message) -> anyhow::Result<()> + Send + 'static,
    {
        self.add(kind, source, false, Box::new(action))
    }

    /// Registers a handler that takes one message and then disposes itself.
    pub fn register_once<F>(&mut self, kind: MessageKind, source: SourceClass, action: F) -> HandlerId
    where
        F: FnMut(&mut Ctx, ConnectionId, Message) -> anyhow::Result<()> + Send + 'static,
    {
        self.add(kind, source, true, Box::new(action))
    }

    /// Disposes a handler. Returns false if it was already disposed.
    pub fn deregister(&mut self, id: HandlerId) -> bool {
        self.handlers
            .iter_mut()
            .find(|h| h.id == id)
            .and_then(|h| h.action.take())
            .is_some()
    }

    pub fn is_live(&self, id: HandlerId) -> bool {
        self.handlers
            .iter()
            .any(|h| h.id == id && h.action.is_some())
    }

    /// Runs one handler directly. Disposed handlers are a logged no-op that
    /// reports [`NetError::DisposedHandler`].
    pub fn invoke(
        &mut self,
        id: HandlerId,
        ctx: &mut Ctx,
        from: ConnectionId,
        msg: Message,
    ) -> Result<anyhow::Result<()>, NetError> {
        let Some(handler) = self.handlers.iter_mut().find(|h| h.id == id) else {
            error!(handler = ?id, "Invoked unknown handler");
            return Err(NetError::DisposedHandler(id));
        };
        let Some(action) = handler.action.as_mut() else {
            error!(handler = ?id, kind = ?handler.kind, "Invoked disposed handler");
            return Err(NetError::DisposedHandler(id));
        };
        let result = action(ctx, from, msg);
        if handler.single_shot && result.is_ok() {
            handler.action = None;
        }
        Ok(result)
    }

    /// Kinds with a live handler for `source`.
    fn served_kinds(&self, source: SourceClass) -> HashSet<MessageKind> {
        self.handlers
            .iter()
            .filter(|h| h.source == source && h.action.is_some())
            .map(|h| h.kind)
            .collect()
    }

    /// Drains connection queues into handlers. Returns the number of
    /// handler invocations.
    pub fn dispatch(&mut self, ctx: &mut Ctx) -> usize {
        let mut invocations = 0;
        for handler in self.handlers.iter_mut() {
            let connections = ctx.connections().ids_of(handler.source);
            'connections: for conn_id in connections {
                loop {
                    let Some(action) = handler.action.as_mut() else {
                        break 'connections;
                    };
                    let msg = match ctx.connections().get_mut(conn_id) {
                        Some(conn) if !conn.is_dropped() => conn.dequeue(handler.kind),
                        _ => None,
                    };
                    let Some(msg) = msg else {
                        break;
                    };
                    invocations += 1;
                    match action(ctx, conn_id, msg) {
                        Ok(()) => {
                            if handler.single_shot {
                                handler.action = None;
                                break 'connections;
                            }
                        }
                        Err(e) => {
                            warn!(
                                kind = ?handler.kind,
                                connection = ?conn_id,
                                error = %e,
                                "Message handler failed"
                            );
                            if handler.single_shot {
                                break 'connections;
                            }
                        }
                    }
                }
            }
        }

        for source in [SourceClass::AllClients, SourceClass::GameServer, SourceClass::Management] {
            let served = self.served_kinds(source);
            let connections = ctx.connections();
            for id in connections.ids_of(source) {
                if let Some(conn) = connections.get_mut(id) {
                    conn.discard_unserved(&served);
                }
            }
        }

        self.handlers.retain(|h| h.action.is_some());
        invocations
    }
}
