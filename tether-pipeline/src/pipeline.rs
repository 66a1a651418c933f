use std::collections::VecDeque;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::mpsc::error::SendError;
use tracing::{debug, trace};

use crate::completion::{Pending, completion};
use crate::error::PipelineError;
use crate::event::Event;
use crate::model::Response;
use crate::operation::{Handler, OpKind, Operation};
use crate::stage::{Context, Stage};

/// A unit of work for the pipeline executor
pub(crate) enum Work {
    RunOp { stage: usize, op: Operation },
    Event { stage: usize, event: Event },
    Complete(Operation),
    Timer { stage: usize, tag: u64 },
}

type Hook = Box<dyn FnMut() + Send>;
type EventHook = Box<dyn FnMut(Event) + Send>;

/// Head of every pipeline, dispatching events to external handlers
#[derive(Default)]
struct PipelineRoot {
    on_connected: Option<Hook>,
    on_disconnected: Option<Hook>,
    on_event: Option<EventHook>,
}

impl Stage for PipelineRoot {
    fn name(&self) -> &'static str {
        "PipelineRoot"
    }

    fn handle_event(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Connected => {
                debug!("connected");
                if let Some(hook) = self.on_connected.as_mut() {
                    hook();
                }
            }
            Event::Disconnected => {
                debug!("disconnected");
                if let Some(hook) = self.on_disconnected.as_mut() {
                    hook();
                }
            }
            event => match self.on_event.as_mut() {
                Some(hook) => hook(event),
                // nothing above the root, so this drops the event
                None => ctx.send_event_up(event),
            },
        }
    }
}

/// Assembles a chain of stages behind a [`PipelineRoot`]
#[derive(Default)]
pub struct PipelineBuilder {
    root: PipelineRoot,
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called whenever the connection is established
    pub fn on_connected<F>(mut self, hook: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.root.on_connected = Some(Box::new(hook));
        self
    }

    /// Called whenever the connection is closed or lost
    pub fn on_disconnected<F>(mut self, hook: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.root.on_disconnected = Some(Box::new(hook));
        self
    }

    /// Called with every other event reaching the root
    pub fn on_event<F>(mut self, hook: F) -> Self
    where
        F: FnMut(Event) + Send + 'static,
    {
        self.root.on_event = Some(Box::new(hook));
        self
    }

    /// Append a stage at the bottom of the chain
    pub fn append_stage<S: Stage>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Start the pipeline executor on the current tokio runtime.
    ///
    /// The executor stops once every [`PipelineHandle`] is dropped.
    pub fn spawn(self) -> PipelineHandle {
        let mut stages: Vec<Box<dyn Stage>> = Vec::with_capacity(self.stages.len() + 1);
        stages.push(Box::new(self.root));
        stages.extend(self.stages);

        let (tx, rx) = mpsc::unbounded_channel();
        let leaf = stages.len() - 1;
        let executor = Executor {
            stages,
            queue: VecDeque::new(),
            mailbox: tx.downgrade(),
        };
        tokio::spawn(executor.run(rx));

        PipelineHandle::new(tx, leaf)
    }
}

/// Sends work into a running pipeline
#[derive(Clone, Debug)]
pub struct PipelineHandle {
    tx: UnboundedSender<Work>,
    leaf: usize,
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Work::RunOp { stage, op } => write!(f, "RunOp({stage}, {})", op.name()),
            Work::Event { stage, event } => write!(f, "Event({stage}, {})", event.name()),
            Work::Complete(op) => write!(f, "Complete({})", op.name()),
            Work::Timer { stage, tag } => write!(f, "Timer({stage}, {tag})"),
        }
    }
}

impl PipelineHandle {
    pub(crate) fn new(tx: UnboundedSender<Work>, leaf: usize) -> Self {
        Self { tx, leaf }
    }

    /// Submit an operation at the root of the pipeline
    pub fn run_op(&self, op: Operation) {
        if let Err(SendError(Work::RunOp { op, .. })) = self.tx.send(Work::RunOp { stage: 0, op }) {
            let mut op = op;
            op.mark_complete(Err(PipelineError::Shutdown));
            finish_detached(op);
        }
    }

    /// Submit an operation of the given kind and wait for its outcome
    pub fn submit(&self, kind: OpKind) -> Pending<Option<Response>> {
        let (completer, pending) = completion();
        self.run_op(Operation::with_callback(kind, move |op| {
            completer.resolve(op.into_result())
        }));
        pending
    }

    /// Submit an operation of the given kind, invoking `callback` with its
    /// outcome from the pipeline context
    pub fn submit_with<F>(&self, kind: OpKind, callback: F)
    where
        F: FnOnce(Result<Option<Response>, PipelineError>) + Send + 'static,
    {
        self.run_op(Operation::with_callback(kind, move |op| {
            callback(op.into_result())
        }));
    }

    /// Complete an operation from outside the pipeline context.
    ///
    /// # Panics
    ///
    /// If the operation was already completed.
    pub fn complete(&self, mut op: Operation, result: Result<(), PipelineError>) {
        op.mark_complete(result);
        if let Err(SendError(Work::Complete(op))) = self.tx.send(Work::Complete(op)) {
            finish_detached(op);
        }
    }

    /// Emit an event from the leaf stage towards the root
    pub fn emit_event(&self, event: Event) {
        let stage = self.leaf.saturating_sub(1);
        if self.tx.send(Work::Event { stage, event }).is_err() {
            debug!("pipeline stopped, dropping event");
        }
    }

    /// Whether the pipeline executor has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Route a completion when the executor is gone. Only callbacks and
/// delegated originals can still be resolved.
fn finish_detached(mut op: Operation) {
    match op.take_handler() {
        Some(Handler::Callback(callback)) => callback(op),
        Some(Handler::Delegated(original)) => {
            let mut original = *original;
            original.response = op.response.take();
            original.mark_complete(op.error.take().map_or(Ok(()), Err));
            finish_detached(original);
        }
        Some(Handler::Serial { original, .. }) => {
            let mut original = *original;
            original.mark_complete(Err(op.error.take().unwrap_or(PipelineError::Shutdown)));
            finish_detached(original);
        }
        Some(Handler::Stage { .. }) | None => {
            trace!(op = op.name(), "dropping completion of stopped pipeline")
        }
    }
}

/// Owns the stages and processes work items one at a time
struct Executor {
    stages: Vec<Box<dyn Stage>>,
    queue: VecDeque<Work>,
    mailbox: WeakUnboundedSender<Work>,
}

impl Executor {
    async fn run(mut self, mut rx: UnboundedReceiver<Work>) {
        while let Some(work) = rx.recv().await {
            self.queue.push_back(work);
            while let Some(work) = self.queue.pop_front() {
                self.dispatch(work);
            }
        }
        debug!("pipeline stopped");
    }

    fn dispatch(&mut self, work: Work) {
        trace!(work = ?work, "dispatching");
        let depth = self.stages.len();
        match work {
            Work::RunOp { stage, op } => {
                let mut ctx = Context::new(stage, depth, &mut self.queue, &self.mailbox);
                self.stages[stage].run_op(&mut ctx, op);
            }
            Work::Event { stage, event } => {
                let mut ctx = Context::new(stage, depth, &mut self.queue, &self.mailbox);
                self.stages[stage].handle_event(&mut ctx, event);
            }
            Work::Timer { stage, tag } => {
                let mut ctx = Context::new(stage, depth, &mut self.queue, &self.mailbox);
                self.stages[stage].on_timer(&mut ctx, tag);
            }
            Work::Complete(op) => self.finish(op),
        }
    }

    fn finish(&mut self, mut op: Operation) {
        let depth = self.stages.len();
        match op.take_handler() {
            None => trace!(op = op.name(), "completed without handler"),
            Some(Handler::Callback(callback)) => callback(op),
            Some(Handler::Stage { stage, tag }) => {
                let mut ctx = Context::new(stage, depth, &mut self.queue, &self.mailbox);
                self.stages[stage].on_op_complete(&mut ctx, op, tag);
            }
            Some(Handler::Delegated(original)) => {
                let mut original = *original;
                if let Some(response) = op.response.take() {
                    original.response = Some(response);
                }
                original.mark_complete(op.error.take().map_or(Ok(()), Err));
                self.queue.push_back(Work::Complete(original));
            }
            Some(Handler::Serial {
                stage,
                original,
                mut remaining,
            }) => {
                let mut ctx = Context::new(stage, depth, &mut self.queue, &self.mailbox);
                match (op.error.take(), remaining.pop_front()) {
                    (Some(err), _) => ctx.complete(*original, Err(err)),
                    (None, Some(mut next)) => {
                        next.set_handler(Handler::Serial {
                            stage,
                            original,
                            remaining,
                        });
                        ctx.send_op_down(next);
                    }
                    (None, None) => ctx.complete(*original, Ok(())),
                }
            }
        }
    }
}
