use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use tether_pipeline::{
    Context, OpId, OpKind, Operation, PipelineError, Request, RequestType, Stage,
};

/// Turns twin operations into correlated twin requests
///
/// The response is checked here, so a twin operation only succeeds when
/// the service accepted the request.
#[derive(Default)]
pub struct TwinStage {
    /// Caller operations by the id of the request sent in their place
    waiting: HashMap<OpId, Operation>,
}

impl TwinStage {
    pub fn new() -> Self {
        Self::default()
    }

    fn send(&mut self, ctx: &mut Context<'_>, op: Operation, request: Request) {
        let forwarded = Operation::new(OpKind::SendRequestAndWait { request });
        self.waiting.insert(forwarded.id(), op);
        ctx.send_op_down_tracked(forwarded, 0);
    }
}

impl Stage for TwinStage {
    fn name(&self) -> &'static str {
        "TwinStage"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        let request = match &op.kind {
            OpKind::GetTwin => Request {
                request_type: RequestType::Twin,
                method: "GET".into(),
                resource_location: "/".into(),
                body: Value::Null,
            },
            OpKind::PatchTwinReportedProperties { patch } => Request {
                request_type: RequestType::Twin,
                method: "PATCH".into(),
                resource_location: "/properties/reported/".into(),
                body: patch.clone(),
            },
            _ => return ctx.send_op_down(op),
        };
        self.send(ctx, op, request);
    }

    fn on_op_complete(&mut self, ctx: &mut Context<'_>, mut forwarded: Operation, _: u64) {
        let Some(mut original) = self.waiting.remove(&forwarded.id()) else {
            return;
        };
        if let Some(err) = forwarded.error.take() {
            return ctx.complete(original, Err(err));
        }

        match forwarded.response.take() {
            Some(response) if response.status_code >= 300 => {
                debug!(status = response.status_code, "twin request rejected");
                let err = PipelineError::Protocol(format!(
                    "twin request failed with status {}",
                    response.status_code
                ));
                ctx.complete(original, Err(err));
            }
            Some(response) => {
                original.response = Some(response);
                ctx.complete(original, Ok(()));
            }
            None => ctx.complete(
                original,
                Err(PipelineError::Protocol("twin request got no response".into())),
            ),
        }
    }
}
