use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tether_pipeline::{
    Context, OpId, OpKind, Operation, PipelineError, Request, RequestType, Response, Stage,
};

use crate::config::PollingConfig;
use crate::models::{RegistrationResult, RegistrationStatus};

/// Name of the feature carrying registration responses
pub(crate) const REGISTER_FEATURE: &str = "register";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollingState {
    #[default]
    Idle,
    SendingRegistration,
    WaitingToPoll,
    SendingPoll,
    Assigned,
    Failed,
    Cancelled,
}

impl PollingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PollingState::Assigned | PollingState::Failed | PollingState::Cancelled
        )
    }
}

/// Drives a registration through registration and status poll requests
///
/// The machine sits right below the pipeline root. It accepts one
/// `Register` operation per instance and completes it once the service
/// assigns the device, the registration fails or it is cancelled. Every
/// request and timer is tagged with the current generation, which
/// cancellation bumps, so anything arriving for an older generation is
/// ignored.
pub struct PollingMachine {
    config: PollingConfig,
    state: PollingState,
    state_tx: watch::Sender<PollingState>,
    generation: u64,

    registration_id: Option<String>,
    body: Value,
    operation_id: Option<String>,
    responses_enabled: bool,

    /// The request currently waiting for an outcome
    in_flight: Option<OpId>,

    /// The caller's `Register` operation
    register_op: Option<Operation>,
}

impl PollingMachine {
    pub fn new(config: PollingConfig) -> (Self, watch::Receiver<PollingState>) {
        let (state_tx, state_rx) = watch::channel(PollingState::Idle);
        let machine = Self {
            config,
            state: PollingState::Idle,
            state_tx,
            generation: 0,
            registration_id: None,
            body: Value::Null,
            operation_id: None,
            responses_enabled: false,
            in_flight: None,
            register_op: None,
        };
        (machine, state_rx)
    }

    fn set_state(&mut self, state: PollingState) {
        debug!(from = ?self.state, to = ?state, "registration state changed");
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn send_tracked(&mut self, ctx: &mut Context<'_>, op: Operation) {
        debug_assert!(self.in_flight.is_none(), "a request is already in flight");
        self.in_flight = Some(op.id());
        ctx.send_op_down_tracked(op, self.generation);
    }

    fn register(&mut self, ctx: &mut Context<'_>, op: Operation, payload: Option<Value>) {
        if self.state != PollingState::Idle {
            return ctx.complete(op, Err(PipelineError::InProgress));
        }
        let Some(registration_id) = &self.registration_id else {
            return ctx.complete(
                op,
                Err(PipelineError::InvalidState(
                    "no security client was set".into(),
                )),
            );
        };

        info!(%registration_id, "registering");
        self.body = json!({
            "registrationId": registration_id,
            "payload": payload,
        });
        self.register_op = Some(op);
        self.set_state(PollingState::SendingRegistration);

        if self.responses_enabled {
            self.send_registration(ctx);
        } else {
            let enable = Operation::new(OpKind::EnableFeature {
                feature: REGISTER_FEATURE.into(),
            });
            self.send_tracked(ctx, enable);
        }
    }

    fn send_registration(&mut self, ctx: &mut Context<'_>) {
        let request = Request {
            request_type: RequestType::Register,
            method: "PUT".into(),
            resource_location: "/".into(),
            body: self.body.clone(),
        };
        self.send_tracked(ctx, Operation::new(OpKind::SendRequestAndWait { request }));
    }

    fn send_poll(&mut self, ctx: &mut Context<'_>, operation_id: String) {
        debug!(%operation_id, "polling registration status");
        let request = Request {
            request_type: RequestType::Query { operation_id },
            method: "GET".into(),
            resource_location: "/".into(),
            body: self.body.clone(),
        };
        self.send_tracked(ctx, Operation::new(OpKind::SendRequestAndWait { request }));
    }

    fn retry_delay(&self, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or(self.config.default_poll_interval)
            .max(self.config.min_poll_interval)
    }

    fn wait(&mut self, ctx: &mut Context<'_>, delay: Duration) {
        debug!(?delay, "waiting before next request");
        self.set_state(PollingState::WaitingToPoll);
        ctx.schedule(delay, self.generation);
    }

    fn fail(&mut self, ctx: &mut Context<'_>, err: PipelineError) {
        warn!("registration failed: {err}");
        self.set_state(PollingState::Failed);
        if let Some(op) = self.register_op.take() {
            ctx.complete(op, Err(err));
        }
    }

    fn on_response(&mut self, ctx: &mut Context<'_>, response: Response) {
        let status = response.status_code;
        if status >= 429 {
            debug!(status, "request throttled");
            let delay = self.retry_delay(response.retry_after);
            return self.wait(ctx, delay);
        }
        if status >= 300 {
            return self.fail(
                ctx,
                PipelineError::Protocol(format!(
                    "service returned status {status}: {}",
                    response.body
                )),
            );
        }

        let result: RegistrationResult = match serde_json::from_value(response.body.clone()) {
            Ok(result) => result,
            Err(err) => {
                return self.fail(
                    ctx,
                    PipelineError::Protocol(format!("invalid registration response: {err}")),
                );
            }
        };

        match result.status {
            RegistrationStatus::Assigning | RegistrationStatus::Unassigned => {
                self.operation_id = Some(result.operation_id);
                let delay = self.retry_delay(response.retry_after);
                self.wait(ctx, delay);
            }
            RegistrationStatus::Assigned => {
                info!(operation_id = %result.operation_id, "device assigned");
                self.set_state(PollingState::Assigned);
                if let Some(mut op) = self.register_op.take() {
                    op.response = Some(response);
                    ctx.complete(op, Ok(()));
                }
            }
            status => {
                let reason = result.error_message().unwrap_or("no reason given");
                self.fail(
                    ctx,
                    PipelineError::Protocol(format!("registration {status:?}: {reason}")),
                );
            }
        }
    }

    fn cancel(&mut self, ctx: &mut Context<'_>, op: Operation) {
        if self.state.is_terminal() {
            return ctx.complete(
                op,
                Err(PipelineError::InvalidState(format!(
                    "registration already {:?}",
                    self.state
                ))),
            );
        }

        info!("cancelling registration");
        self.generation += 1;
        self.set_state(PollingState::Cancelled);

        if let Some(target) = self.in_flight.take() {
            ctx.send_op_down(Operation::new(OpKind::CancelRequest { target }));
        }
        if let Some(register) = self.register_op.take() {
            ctx.complete(register, Err(PipelineError::Cancelled));
        }
        ctx.delegate(op, Operation::new(OpKind::Disconnect));
    }
}

impl Stage for PollingMachine {
    fn name(&self) -> &'static str {
        "PollingMachine"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        match &op.kind {
            OpKind::SetSecurityClient(client) => {
                self.registration_id = Some(client.registration_id.clone());
                ctx.send_op_down(op);
            }
            OpKind::Register { payload } => {
                let payload = payload.clone();
                self.register(ctx, op, payload);
            }
            OpKind::CancelRegistration => self.cancel(ctx, op),
            _ => ctx.send_op_down(op),
        }
    }

    fn on_op_complete(&mut self, ctx: &mut Context<'_>, mut op: Operation, generation: u64) {
        if generation != self.generation || self.in_flight != Some(op.id()) {
            debug!(op = op.name(), "ignoring stale completion");
            return;
        }
        self.in_flight = None;

        if let Some(err) = op.error.take() {
            return self.fail(ctx, err);
        }

        match &op.kind {
            OpKind::EnableFeature { .. } => {
                self.responses_enabled = true;
                self.send_registration(ctx);
            }
            _ => match op.response.take() {
                Some(response) => self.on_response(ctx, response),
                None => self.fail(
                    ctx,
                    PipelineError::Protocol("request completed without a response".into()),
                ),
            },
        }
    }

    fn on_timer(&mut self, ctx: &mut Context<'_>, generation: u64) {
        if generation != self.generation || self.state != PollingState::WaitingToPoll {
            debug!("ignoring stale timer");
            return;
        }

        match self.operation_id.clone() {
            Some(operation_id) => {
                self.set_state(PollingState::SendingPoll);
                self.send_poll(ctx, operation_id);
            }
            // throttled before the service assigned an operation
            None => {
                self.set_state(PollingState::SendingRegistration);
                self.send_registration(ctx);
            }
        }
    }
}
