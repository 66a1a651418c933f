//! Helpers for driving a pipeline from tests without a network.

use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::PipelineError;
use crate::event::Event;
use crate::operation::Operation;
use crate::pipeline::PipelineHandle;
use crate::stage::{Context, Stage};

/// Leaf stage handing every operation it receives to a [`TransportMonitor`]
pub struct ChannelTransport {
    tx: UnboundedSender<(Operation, Option<PipelineHandle>)>,
}

/// Test side of a [`ChannelTransport`].
///
/// Operations received here must be completed through the
/// [`PipelineHandle`], exactly like an I/O task of a real transport would.
/// The monitor keeps the handle of the pipeline that sent the last operation,
/// for tests that have no handle of their own.
pub struct TransportMonitor {
    rx: UnboundedReceiver<(Operation, Option<PipelineHandle>)>,
    handle: Option<PipelineHandle>,
}

pub fn channel_transport() -> (ChannelTransport, TransportMonitor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelTransport { tx }, TransportMonitor { rx, handle: None })
}

impl Stage for ChannelTransport {
    fn name(&self) -> &'static str {
        "ChannelTransport"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        if let Err(mpsc::error::SendError((op, _))) = self.tx.send((op, ctx.handle())) {
            ctx.complete(op, Err(PipelineError::Transport("monitor dropped".into())));
        }
    }
}

impl TransportMonitor {
    /// Wait for the next operation reaching the transport
    pub async fn next_op(&mut self) -> Operation {
        let (op, handle) = tokio::time::timeout(Duration::from_secs(60), self.rx.recv())
            .await
            .expect("timed out waiting for an operation")
            .expect("pipeline stopped");
        if handle.is_some() {
            self.handle = handle;
        }
        op
    }

    /// Wait for the next operation and check its kind
    pub async fn expect_op(&mut self, name: &str) -> Operation {
        let op = self.next_op().await;
        assert_eq!(op.name(), name, "unexpected operation {op:?}");
        op
    }

    /// Return an operation if one is already waiting
    pub fn try_next_op(&mut self) -> Option<Operation> {
        let (op, handle) = self.rx.try_recv().ok()?;
        if handle.is_some() {
            self.handle = handle;
        }
        Some(op)
    }

    fn pipeline(&self) -> &PipelineHandle {
        self.handle
            .as_ref()
            .expect("no operation has reached the monitor yet")
    }

    /// Complete an operation on the pipeline it came from
    pub fn complete(&self, op: Operation, result: Result<(), PipelineError>) {
        self.pipeline().complete(op, result);
    }

    /// Emit an event from the transport of the last seen pipeline
    pub fn emit_event(&self, event: Event) {
        self.pipeline().emit_event(event);
    }
}

/// Give spawned tasks, including the pipeline executor, a chance to run
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
