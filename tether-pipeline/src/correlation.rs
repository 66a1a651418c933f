use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tether_util::json::{deserialize_duration_from_ms, serialize_duration_to_ms};

use crate::RequestId;
use crate::error::PipelineError;
use crate::event::Event;
use crate::model::Request;
use crate::operation::{OpId, OpKind, Operation};
use crate::stage::{Context, Stage};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CorrelationConfig {
    /// How long a request may wait for its response
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub response_timeout: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(30_000),
        }
    }
}

struct PendingRequest {
    op: Operation,
    seq: u64,
}

/// Turns a request plus its asynchronous response event into a single
/// completed operation
pub struct CorrelationStage {
    config: CorrelationConfig,
    pending: HashMap<RequestId, PendingRequest>,
    next_seq: u64,
}

impl CorrelationStage {
    pub fn new(config: CorrelationConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    fn send_request(&mut self, ctx: &mut Context<'_>, op: Operation, request: Request) {
        let mut request_id = RequestId::new();
        while self.pending.contains_key(&request_id) {
            request_id = RequestId::new();
        }

        let send = Operation::new(OpKind::SendRequest {
            request,
            request_id: request_id.clone(),
        });

        self.next_seq += 1;
        let seq = self.next_seq;
        debug!(%request_id, op = %op.id(), "waiting for response");
        self.pending.insert(request_id, PendingRequest { op, seq });

        ctx.schedule(self.config.response_timeout, seq);
        ctx.send_op_down_tracked(send, 0);
    }

    fn cancel_request(&mut self, ctx: &mut Context<'_>, op: Operation, target: OpId) {
        let request_id = self
            .pending
            .iter()
            .find(|(_, p)| p.op.id() == target)
            .map(|(id, _)| id.clone());

        if let Some(PendingRequest { op: waiting, .. }) =
            request_id.and_then(|id| self.pending.remove(&id))
        {
            debug!(op = %waiting.id(), "request abandoned");
            ctx.complete(waiting, Err(PipelineError::Cancelled));
        }
        ctx.complete(op, Ok(()));
    }

    /// Number of requests waiting for a response
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for CorrelationStage {
    fn default() -> Self {
        Self::new(CorrelationConfig::default())
    }
}

impl Stage for CorrelationStage {
    fn name(&self) -> &'static str {
        "CorrelationStage"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        match &op.kind {
            OpKind::SendRequestAndWait { request } => {
                let request = request.clone();
                self.send_request(ctx, op, request);
            }
            OpKind::CancelRequest { target } => {
                let target = *target;
                self.cancel_request(ctx, op, target);
            }
            _ => ctx.send_op_down(op),
        }
    }

    fn on_op_complete(&mut self, ctx: &mut Context<'_>, mut op: Operation, _: u64) {
        let Some(err) = op.error.take() else {
            return;
        };
        let OpKind::SendRequest { request_id, .. } = &op.kind else {
            return;
        };

        // the request never left, so no response will come for it
        if let Some(PendingRequest { op: waiting, .. }) = self.pending.remove(request_id) {
            warn!(%request_id, "request failed: {err}");
            ctx.complete(waiting, Err(err));
        }
    }

    fn handle_event(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Response {
                request_id,
                response,
            } => match self.pending.remove(&request_id) {
                Some(PendingRequest { mut op, .. }) => {
                    debug!(%request_id, status = response.status_code, "response received");
                    op.response = Some(response);
                    ctx.complete(op, Ok(()));
                }
                None => debug!(%request_id, "dropping response for unknown request"),
            },
            event => ctx.send_event_up(event),
        }
    }

    fn on_timer(&mut self, ctx: &mut Context<'_>, seq: u64) {
        let expired = self
            .pending
            .iter()
            .find(|(_, p)| p.seq == seq)
            .map(|(id, _)| id.clone());

        if let Some(request_id) = expired
            && let Some(PendingRequest { op, .. }) = self.pending.remove(&request_id)
        {
            warn!(%request_id, "timed out waiting for response");
            ctx.complete(op, Err(PipelineError::Timeout));
        }
    }
}
