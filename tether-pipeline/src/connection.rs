use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::event::Event;
use crate::operation::{OpKind, Operation};
use crate::stage::{Context, Stage};

const CONNECT: u64 = 0;
const DISCONNECT: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Owns the connection state and holds back operations that need a
/// connection until one is available
///
/// At most one connect attempt is in flight. Operations arriving while it
/// is in flight wait for its outcome.
#[derive(Default)]
pub struct ConnectionStage {
    state: ConnectionState,

    /// Operations waiting for a connection before going down
    blocked: VecDeque<Operation>,

    /// Explicit connect and reconnect requests waiting for an outcome
    connect_waiters: Vec<Operation>,

    /// Explicit disconnect requests waiting for an outcome
    disconnect_waiters: Vec<Operation>,
}

impl ConnectionStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn start_connect(&mut self, ctx: &mut Context<'_>) {
        debug!("connecting");
        self.state = ConnectionState::Connecting;
        ctx.send_op_down_tracked(Operation::new(OpKind::Connect), CONNECT);
    }

    fn start_disconnect(&mut self, ctx: &mut Context<'_>) {
        debug!("disconnecting");
        self.state = ConnectionState::Disconnecting;
        ctx.send_op_down_tracked(Operation::new(OpKind::Disconnect), DISCONNECT);
    }

    fn on_connect_complete(&mut self, ctx: &mut Context<'_>, result: Result<(), PipelineError>) {
        match result {
            Ok(()) => {
                info!("connected");
                self.state = ConnectionState::Connected;
                ctx.send_event_up(Event::Connected);

                for op in self.connect_waiters.drain(..) {
                    ctx.complete(op, Ok(()));
                }
                for op in self.blocked.drain(..) {
                    ctx.send_op_down(op);
                }
                if !self.disconnect_waiters.is_empty() {
                    self.start_disconnect(ctx);
                }
            }
            Err(err) => {
                let err = err.into_connect();
                warn!("{err}");
                self.state = ConnectionState::Disconnected;

                for op in self.connect_waiters.drain(..) {
                    ctx.complete(op, Err(err.clone()));
                }
                for op in self.blocked.drain(..) {
                    ctx.complete(op, Err(err.clone()));
                }
                for op in self.disconnect_waiters.drain(..) {
                    ctx.complete(op, Ok(()));
                }
            }
        }
    }

    fn on_disconnect_complete(
        &mut self,
        ctx: &mut Context<'_>,
        result: Result<(), PipelineError>,
    ) {
        self.state = ConnectionState::Disconnected;
        if result.is_ok() {
            info!("disconnected");
            ctx.send_event_up(Event::Disconnected);
        }
        for op in self.disconnect_waiters.drain(..) {
            ctx.complete(op, result.clone());
        }

        // someone asked for a connection while we were going away
        if !self.connect_waiters.is_empty() || !self.blocked.is_empty() {
            self.start_connect(ctx);
        }
    }
}

impl Stage for ConnectionStage {
    fn name(&self) -> &'static str {
        "ConnectionStage"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        use ConnectionState::*;

        match (&op.kind, self.state) {
            (OpKind::Connect, Connected) => ctx.complete(op, Ok(())),
            (OpKind::Connect, Disconnected) => {
                self.connect_waiters.push(op);
                self.start_connect(ctx);
            }
            (OpKind::Connect, Connecting | Disconnecting) => self.connect_waiters.push(op),

            (OpKind::Disconnect, Disconnected) => ctx.complete(op, Ok(())),
            (OpKind::Disconnect, Connected) => {
                self.disconnect_waiters.push(op);
                self.start_disconnect(ctx);
            }
            (OpKind::Disconnect, Connecting | Disconnecting) => self.disconnect_waiters.push(op),

            (OpKind::Reconnect, Connected) => {
                self.connect_waiters.push(op);
                self.start_disconnect(ctx);
            }
            (OpKind::Reconnect, Disconnected) => {
                self.connect_waiters.push(op);
                self.start_connect(ctx);
            }
            (OpKind::Reconnect, Connecting | Disconnecting) => self.connect_waiters.push(op),

            _ if !op.needs_connection => ctx.send_op_down(op),

            (_, Connected) => ctx.send_op_down(op),
            (_, Disconnected) => {
                debug!(op = op.name(), "waiting for connection");
                self.blocked.push_back(op);
                self.start_connect(ctx);
            }
            (_, Connecting | Disconnecting) => self.blocked.push_back(op),
        }
    }

    fn on_op_complete(&mut self, ctx: &mut Context<'_>, mut op: Operation, tag: u64) {
        let result = op.error.take().map_or(Ok(()), Err);
        match tag {
            CONNECT => self.on_connect_complete(ctx, result),
            _ => self.on_disconnect_complete(ctx, result),
        }
    }

    fn handle_event(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Disconnected if self.state == ConnectionState::Connected => {
                warn!("connection lost");
                self.state = ConnectionState::Disconnected;
                ctx.send_event_up(Event::Disconnected);
            }
            Event::Disconnected => {
                debug!(state = ?self.state, "ignoring transport disconnect");
            }
            event => ctx.send_event_up(event),
        }
    }
}
