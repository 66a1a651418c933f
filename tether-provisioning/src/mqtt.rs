//! Provisioning over MQTT.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use url::form_urlencoded;

use tether_pipeline::{
    Context, Event, MqttConnectionArgs, OpKind, Operation, PipelineError, RequestId, Response,
    Stage,
};

use crate::polling::REGISTER_FEATURE;

const API_VERSION: &str = "2019-03-31";
const USER_AGENT: &str = concat!("tether/", env!("CARGO_PKG_VERSION"));

const RESPONSE_TOPIC_PREFIX: &str = "$dps/registrations/res/";
const SUBSCRIBE_TOPIC: &str = "$dps/registrations/res/#";

fn register_topic(request_id: &RequestId) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={request_id}")
}

fn query_topic(request_id: &RequestId, operation_id: &str) -> String {
    format!(
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={request_id}&operationId={operation_id}"
    )
}

fn username(id_scope: &str, registration_id: &str) -> String {
    let client_version: String = form_urlencoded::byte_serialize(USER_AGENT.as_bytes()).collect();
    format!(
        "{id_scope}/registrations/{registration_id}/api-version={API_VERSION}&ClientVersion={client_version}"
    )
}

/// Decode a response topic into its request id and response
///
/// Returns `None` for topics that are not provisioning responses.
fn parse_response(topic: &str, payload: &[u8]) -> Option<Result<(RequestId, Response), String>> {
    let rest = topic.strip_prefix(RESPONSE_TOPIC_PREFIX)?;
    Some(parse_response_parts(rest, payload))
}

fn parse_response_parts(rest: &str, payload: &[u8]) -> Result<(RequestId, Response), String> {
    let (status, query) = rest
        .split_once("/?")
        .ok_or_else(|| format!("malformed response topic {rest}"))?;
    let status_code: u16 = status
        .parse()
        .map_err(|_| format!("invalid status code {status}"))?;

    let mut request_id = None;
    let mut retry_after = None;
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "$rid" => request_id = Some(RequestId::from(value.into_owned())),
            "retry-after" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("invalid retry-after {value}"))?;
                retry_after = Some(Duration::from_secs(secs));
            }
            _ => {}
        }
    }
    let request_id = request_id.ok_or("response topic carries no request id")?;

    let body = if payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
    };

    let mut response = Response::new(status_code, body);
    response.retry_after = retry_after;
    Ok((request_id, response))
}

/// Converts provisioning operations into MQTT operations and MQTT messages
/// on the response topic into [`Event::Response`]
#[derive(Default)]
pub struct ProvisioningMqttConverter;

impl Stage for ProvisioningMqttConverter {
    fn name(&self) -> &'static str {
        "ProvisioningMqttConverter"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        let kind = match &op.kind {
            OpKind::SetSecurityClientArgs {
                provisioning_host,
                registration_id,
                id_scope,
                ca_cert,
            } => OpKind::SetMqttConnectionArgs(MqttConnectionArgs {
                client_id: registration_id.clone(),
                hostname: provisioning_host.clone(),
                username: username(id_scope, registration_id),
                ca_cert: ca_cert.clone(),
            }),
            OpKind::SendRegistrationRequest {
                request_id,
                payload,
            } => OpKind::MqttPublish {
                topic: register_topic(request_id),
                payload: payload.to_string().into_bytes(),
            },
            OpKind::SendQueryRequest {
                request_id,
                operation_id,
                payload,
            } => OpKind::MqttPublish {
                topic: query_topic(request_id, operation_id),
                payload: payload.to_string().into_bytes(),
            },
            OpKind::EnableFeature { feature } | OpKind::DisableFeature { feature }
                if feature != REGISTER_FEATURE =>
            {
                let err = PipelineError::Protocol(format!("unknown feature {feature}"));
                return ctx.complete(op, Err(err));
            }
            OpKind::EnableFeature { .. } => OpKind::MqttSubscribe {
                topic: SUBSCRIBE_TOPIC.into(),
            },
            OpKind::DisableFeature { .. } => OpKind::MqttUnsubscribe {
                topic: SUBSCRIBE_TOPIC.into(),
            },
            _ => return ctx.send_op_down(op),
        };
        ctx.delegate(op, Operation::new(kind));
    }

    fn handle_event(&mut self, ctx: &mut Context<'_>, event: Event) {
        let Event::IncomingMqttMessage { topic, payload } = &event else {
            return ctx.send_event_up(event);
        };

        match parse_response(topic, payload) {
            Some(Ok((request_id, response))) => {
                debug!(%request_id, status = response.status_code, "registration response");
                ctx.send_event_up(Event::Response {
                    request_id,
                    response,
                });
            }
            Some(Err(err)) => warn!(%topic, "dropping invalid response: {err}"),
            None => {
                warn!(%topic, "unknown topic");
                ctx.send_event_up(event);
            }
        }
    }
}
