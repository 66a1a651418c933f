use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc::WeakUnboundedSender;
use tracing::{debug, trace, warn};

use crate::error::PipelineError;
use crate::event::Event;
use crate::operation::{Handler, Operation};
use crate::pipeline::{PipelineHandle, Work};

/// A processing unit of the pipeline
///
/// Stages are owned by the pipeline executor and are only ever invoked from
/// it, one work item at a time. Unrecognized operations should be forwarded
/// with [`Context::send_op_down`] and unrecognized events with
/// [`Context::send_event_up`], which is what the default methods do.
pub trait Stage: Send + 'static {
    fn name(&self) -> &'static str;

    /// Entry point for operations coming from the stage above
    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        ctx.send_op_down(op);
    }

    /// Entry point for events coming from the stage below
    fn handle_event(&mut self, ctx: &mut Context<'_>, event: Event) {
        ctx.send_event_up(event);
    }

    /// Called when an operation sent with [`Context::send_op_down_tracked`]
    /// completes
    fn on_op_complete(&mut self, ctx: &mut Context<'_>, op: Operation, tag: u64) {
        let _ = (ctx, tag);
        debug!(stage = self.name(), op = op.name(), "ignoring completion");
    }

    /// Called when a timer set with [`Context::schedule`] expires
    fn on_timer(&mut self, ctx: &mut Context<'_>, tag: u64) {
        let _ = (ctx, tag);
    }
}

/// A stage's view of the pipeline while it handles a work item
pub struct Context<'a> {
    index: usize,
    depth: usize,
    queue: &'a mut VecDeque<Work>,
    mailbox: &'a WeakUnboundedSender<Work>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        index: usize,
        depth: usize,
        queue: &'a mut VecDeque<Work>,
        mailbox: &'a WeakUnboundedSender<Work>,
    ) -> Self {
        Self {
            index,
            depth,
            queue,
            mailbox,
        }
    }

    /// Pass an operation to the next stage.
    ///
    /// If there is no next stage the operation fails as unhandled.
    pub fn send_op_down(&mut self, op: Operation) {
        let next = self.index + 1;
        if next < self.depth {
            trace!(op = op.name(), stage = next, "sending op down");
            self.queue.push_back(Work::RunOp { stage: next, op });
        } else {
            let name = op.name();
            warn!(op = name, "operation reached the end of the pipeline");
            self.complete(op, Err(PipelineError::Unhandled(name)));
        }
    }

    /// Pass an operation to the next stage and get it back through
    /// [`Stage::on_op_complete`] with `tag` once it completes
    pub fn send_op_down_tracked(&mut self, mut op: Operation, tag: u64) {
        op.set_handler(Handler::Stage {
            stage: self.index,
            tag,
        });
        self.send_op_down(op);
    }

    /// Replace `original` with `op`.
    ///
    /// When `op` completes, its error and response are copied into
    /// `original`, which is then completed.
    pub fn delegate(&mut self, original: Operation, mut op: Operation) {
        trace!(from = original.name(), to = op.name(), "delegating");
        op.set_handler(Handler::Delegated(Box::new(original)));
        self.send_op_down(op);
    }

    /// Run `ops` one after the other below this stage and complete
    /// `original` when all of them succeed, or with the first failure.
    pub fn run_ops_serial(&mut self, original: Operation, ops: Vec<Operation>) {
        let mut remaining: VecDeque<_> = ops.into();
        match remaining.pop_front() {
            Some(mut first) => {
                first.set_handler(Handler::Serial {
                    stage: self.index,
                    original: Box::new(original),
                    remaining,
                });
                self.send_op_down(first);
            }
            None => self.complete(original, Ok(())),
        }
    }

    /// Complete an operation, routing it to its completion handler.
    ///
    /// # Panics
    ///
    /// If the operation was already completed.
    pub fn complete(&mut self, mut op: Operation, result: Result<(), PipelineError>) {
        op.mark_complete(result);
        self.queue.push_back(Work::Complete(op));
    }

    /// Pass an event to the previous stage.
    ///
    /// At the root the event has nowhere to go and is dropped.
    pub fn send_event_up(&mut self, event: Event) {
        match self.index.checked_sub(1) {
            Some(prev) => self.queue.push_back(Work::Event { stage: prev, event }),
            None => warn!(event = event.name(), "dropping unhandled event"),
        }
    }

    /// Re-enter this stage through [`Stage::on_timer`] after `delay`.
    ///
    /// The wait happens outside of the pipeline context.
    pub fn schedule(&mut self, delay: Duration, tag: u64) {
        let mailbox = self.mailbox.clone();
        let stage = self.index;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(Work::Timer { stage, tag });
            }
        });
    }

    /// A handle for completing operations and emitting events from outside
    /// the pipeline context, e.g. from I/O tasks spawned by a leaf stage.
    ///
    /// Returns `None` if the pipeline is shutting down.
    pub fn handle(&self) -> Option<PipelineHandle> {
        self.mailbox
            .upgrade()
            .map(|tx| PipelineHandle::new(tx, self.depth - 1))
    }

    /// Position of the current stage in the chain, the root being 0
    pub fn index(&self) -> usize {
        self.index
    }
}
