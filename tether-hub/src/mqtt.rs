//! Hub topics over MQTT.

use serde_json::Value;
use tracing::{debug, warn};
use url::form_urlencoded;

use tether_pipeline::{
    AuthProviderArgs, Context, Event, Message, MethodRequest, MethodResponse,
    MqttConnectionArgs, OpKind, Operation, PipelineError, Request, RequestId, RequestType,
    Response, Stage,
};

use crate::feature::Feature;

const API_VERSION: &str = "2018-06-30";

const METHODS_PREFIX: &str = "$iothub/methods/POST/";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const TWIN_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

/// Topic names of one device or module identity
#[derive(Debug, Clone)]
struct Topics {
    telemetry: String,
    c2d: String,
    input: Option<String>,
}

impl Topics {
    fn new(device_id: &str, module_id: Option<&str>) -> Self {
        let base = match module_id {
            Some(module_id) => format!("devices/{device_id}/modules/{module_id}"),
            None => format!("devices/{device_id}"),
        };
        Self {
            telemetry: format!("{base}/messages/events/"),
            c2d: format!("devices/{device_id}/messages/devicebound/"),
            input: module_id.map(|_| format!("{base}/inputs/")),
        }
    }

    fn subscription(&self, feature: Feature) -> Result<String, PipelineError> {
        let topic = match feature {
            Feature::C2d => format!("{}#", self.c2d),
            Feature::Input => match &self.input {
                Some(input) => format!("{input}#"),
                None => {
                    return Err(PipelineError::InvalidState(
                        "input messages are only available to modules".into(),
                    ));
                }
            },
            Feature::Methods => format!("{METHODS_PREFIX}#"),
            Feature::Twin => format!("{TWIN_RESPONSE_PREFIX}#"),
            Feature::TwinPatches => format!("{TWIN_PATCH_PREFIX}#"),
        };
        Ok(topic)
    }
}

/// Append the message system and custom properties to a topic
fn encode_properties(topic: &str, message: &Message) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    let system = [
        ("$.on", &message.output_name),
        ("$.mid", &message.message_id),
        ("$.cid", &message.correlation_id),
        ("$.ct", &message.content_type),
        ("$.ce", &message.content_encoding),
    ];
    for (key, value) in system {
        if let Some(value) = value {
            serializer.append_pair(key, value);
        }
    }
    for (key, value) in &message.custom_properties {
        serializer.append_pair(key, value);
    }
    format!("{topic}{}", serializer.finish())
}

/// Fill a message from the properties carried by its topic
fn decode_properties(properties: &str, message: &mut Message) {
    for (key, value) in form_urlencoded::parse(properties.as_bytes()) {
        let value = value.into_owned();
        match key.as_ref() {
            "$.mid" => message.message_id = Some(value),
            "$.cid" => message.correlation_id = Some(value),
            "$.ct" => message.content_type = Some(value),
            "$.ce" => message.content_encoding = Some(value),
            key if key.starts_with("$.") || key.starts_with("iothub-") => {}
            key => {
                message.custom_properties.insert(key.to_owned(), value);
            }
        }
    }
}

fn json_body(payload: &[u8]) -> Value {
    if payload.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}

/// Value of `key` in the query part of a topic
fn query_value(query: &str, key: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn twin_topic(request: &Request, request_id: &RequestId) -> String {
    format!(
        "$iothub/twin/{}{}?$rid={request_id}",
        request.method, request.resource_location
    )
}

/// Converts hub operations into MQTT operations, and incoming MQTT
/// messages into hub events
#[derive(Default)]
pub struct HubMqttConverter {
    topics: Option<Topics>,
}

impl HubMqttConverter {
    pub fn new() -> Self {
        Self::default()
    }

    fn connection_args(&mut self, args: &AuthProviderArgs) -> OpKind {
        self.topics = Some(Topics::new(&args.device_id, args.module_id.as_deref()));

        let client_id = match &args.module_id {
            Some(module_id) => format!("{}/{module_id}", args.device_id),
            None => args.device_id.clone(),
        };
        OpKind::SetMqttConnectionArgs(MqttConnectionArgs {
            username: format!("{}/{client_id}/?api-version={API_VERSION}", args.hostname),
            hostname: args
                .gateway_hostname
                .clone()
                .unwrap_or_else(|| args.hostname.clone()),
            client_id,
            ca_cert: args.ca_cert.clone(),
        })
    }

    fn convert(&mut self, kind: &OpKind) -> Result<Option<OpKind>, PipelineError> {
        if let OpKind::SetAuthProviderArgs(args) = kind {
            return Ok(Some(self.connection_args(args)));
        }

        let topics = || {
            self.topics.as_ref().ok_or_else(|| {
                PipelineError::InvalidState("auth provider arguments were not set".into())
            })
        };

        let converted = match kind {
            OpKind::SendTelemetry { message } => OpKind::MqttPublish {
                topic: encode_properties(&topics()?.telemetry, message),
                payload: message.data.clone(),
            },
            OpKind::SendOutputEvent {
                output_name,
                message,
            } => {
                let mut message = message.clone();
                message.output_name = Some(output_name.clone());
                OpKind::MqttPublish {
                    topic: encode_properties(&topics()?.telemetry, &message),
                    payload: message.data,
                }
            }
            OpKind::SendMethodResponse(MethodResponse {
                request_id,
                status,
                payload,
            }) => OpKind::MqttPublish {
                topic: format!("$iothub/methods/res/{status}/?$rid={request_id}"),
                payload: payload.to_string().into_bytes(),
            },
            OpKind::EnableFeature { feature } => OpKind::MqttSubscribe {
                topic: topics()?.subscription(feature.parse()?)?,
            },
            OpKind::DisableFeature { feature } => OpKind::MqttUnsubscribe {
                topic: topics()?.subscription(feature.parse()?)?,
            },
            OpKind::SendRequest {
                request,
                request_id,
            } => match request.request_type {
                RequestType::Twin => OpKind::MqttPublish {
                    topic: twin_topic(request, request_id),
                    payload: request.body.to_string().into_bytes(),
                },
                _ => {
                    return Err(PipelineError::Protocol(format!(
                        "unsupported request type {:?}",
                        request.request_type
                    )));
                }
            },
            _ => return Ok(None),
        };
        Ok(Some(converted))
    }

    fn decode(&self, topic: &str, payload: &[u8]) -> Option<Event> {
        if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
            let (status, query) = rest.split_once("/?")?;
            let status_code = status.parse().ok()?;
            let request_id = query_value(query, "$rid")?;
            return Some(Event::Response {
                request_id: RequestId::from(request_id),
                response: Response::new(status_code, json_body(payload)),
            });
        }
        if topic.starts_with(TWIN_PATCH_PREFIX) {
            return Some(Event::TwinDesiredPropertiesPatch(json_body(payload)));
        }
        if let Some(rest) = topic.strip_prefix(METHODS_PREFIX) {
            let (name, query) = rest.split_once("/?")?;
            return Some(Event::MethodRequest(MethodRequest {
                request_id: query_value(query, "$rid")?,
                name: name.to_owned(),
                payload: json_body(payload),
            }));
        }

        let topics = self.topics.as_ref()?;
        if let Some(properties) = topic.strip_prefix(&topics.c2d) {
            let mut message = Message::new(payload);
            decode_properties(properties, &mut message);
            return Some(Event::C2dMessage(message));
        }
        if let Some(rest) = topics.input.as_ref().and_then(|p| topic.strip_prefix(p.as_str())) {
            let (input_name, properties) = rest.split_once('/').unwrap_or((rest, ""));
            let mut message = Message::new(payload);
            decode_properties(properties, &mut message);
            return Some(Event::InputMessage {
                input_name: input_name.to_owned(),
                message,
            });
        }
        None
    }
}

impl Stage for HubMqttConverter {
    fn name(&self) -> &'static str {
        "HubMqttConverter"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        match self.convert(&op.kind) {
            Ok(Some(kind)) => ctx.delegate(op, Operation::new(kind)),
            Ok(None) => ctx.send_op_down(op),
            Err(err) => ctx.complete(op, Err(err)),
        }
    }

    fn handle_event(&mut self, ctx: &mut Context<'_>, event: Event) {
        let Event::IncomingMqttMessage { topic, payload } = &event else {
            return ctx.send_event_up(event);
        };

        match self.decode(topic, payload) {
            Some(decoded) => {
                debug!(%topic, event = decoded.name(), "message received");
                ctx.send_event_up(decoded);
            }
            None => {
                warn!(%topic, "unknown topic");
                ctx.send_event_up(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn converter(module_id: Option<&str>) -> HubMqttConverter {
        let mut converter = HubMqttConverter::new();
        converter.connection_args(&AuthProviderArgs {
            device_id: "dev-1".into(),
            module_id: module_id.map(Into::into),
            hostname: "hub.example.net".into(),
            gateway_hostname: None,
            ca_cert: None,
        });
        converter
    }

    #[test]
    fn test_connection_args_for_module_behind_gateway() {
        let mut converter = HubMqttConverter::new();
        let kind = converter.connection_args(&AuthProviderArgs {
            device_id: "dev-1".into(),
            module_id: Some("filter".into()),
            hostname: "hub.example.net".into(),
            gateway_hostname: Some("edge.local".into()),
            ca_cert: Some("ca".into()),
        });
        assert_eq!(
            kind,
            OpKind::SetMqttConnectionArgs(MqttConnectionArgs {
                client_id: "dev-1/filter".into(),
                hostname: "edge.local".into(),
                username: "hub.example.net/dev-1/filter/?api-version=2018-06-30".into(),
                ca_cert: Some("ca".into()),
            })
        );
    }

    #[test]
    fn test_telemetry_topic_carries_properties() {
        let mut converter = converter(None);
        let mut message = Message::new("hello");
        message.message_id = Some("m1".into());
        message.content_type = Some("application/json".into());
        message
            .custom_properties
            .insert("alert".into(), "high temp".into());

        let kind = converter
            .convert(&OpKind::SendTelemetry { message })
            .unwrap()
            .unwrap();
        assert_eq!(
            kind,
            OpKind::MqttPublish {
                topic: "devices/dev-1/messages/events/%24.mid=m1&%24.ct=application%2Fjson&alert=high+temp".into(),
                payload: b"hello".to_vec(),
            }
        );
    }

    #[test]
    fn test_output_event_sets_output_name() {
        let mut converter = converter(Some("filter"));
        let kind = converter
            .convert(&OpKind::SendOutputEvent {
                output_name: "out1".into(),
                message: Message::new("x"),
            })
            .unwrap()
            .unwrap();
        match kind {
            OpKind::MqttPublish { topic, .. } => {
                assert_eq!(topic, "devices/dev-1/modules/filter/messages/events/%24.on=out1")
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn test_feature_subscriptions() {
        let mut device = converter(None);
        let subscribe = |c: &mut HubMqttConverter, feature: &str| {
            c.convert(&OpKind::EnableFeature {
                feature: feature.into(),
            })
        };

        assert_eq!(
            subscribe(&mut device, "c2d").unwrap(),
            Some(OpKind::MqttSubscribe {
                topic: "devices/dev-1/messages/devicebound/#".into()
            })
        );
        assert_eq!(
            subscribe(&mut device, "twin_patches").unwrap(),
            Some(OpKind::MqttSubscribe {
                topic: "$iothub/twin/PATCH/properties/desired/#".into()
            })
        );
        assert!(matches!(
            subscribe(&mut device, "input"),
            Err(PipelineError::InvalidState(_))
        ));
        assert!(matches!(
            subscribe(&mut device, "bogus"),
            Err(PipelineError::Protocol(_))
        ));

        let mut module = converter(Some("filter"));
        assert_eq!(
            subscribe(&mut module, "input").unwrap(),
            Some(OpKind::MqttSubscribe {
                topic: "devices/dev-1/modules/filter/inputs/#".into()
            })
        );
    }

    #[test]
    fn test_operations_before_auth_args_fail() {
        let mut converter = HubMqttConverter::new();
        let res = converter.convert(&OpKind::SendTelemetry {
            message: Message::new("x"),
        });
        assert!(matches!(res, Err(PipelineError::InvalidState(_))));
    }

    #[test]
    fn test_twin_request_topic() {
        let mut converter = converter(None);
        let kind = converter
            .convert(&OpKind::SendRequest {
                request: Request {
                    request_type: RequestType::Twin,
                    method: "PATCH".into(),
                    resource_location: "/properties/reported/".into(),
                    body: json!({"fw": "1.2"}),
                },
                request_id: RequestId::from("r1"),
            })
            .unwrap()
            .unwrap();
        assert_eq!(
            kind,
            OpKind::MqttPublish {
                topic: "$iothub/twin/PATCH/properties/reported/?$rid=r1".into(),
                payload: br#"{"fw":"1.2"}"#.to_vec(),
            }
        );
    }

    #[test]
    fn test_decode_incoming_messages() {
        let converter = converter(Some("filter"));

        let c2d = converter
            .decode(
                "devices/dev-1/messages/devicebound/%24.mid=m7&%24.to=%2Fdevices%2Fdev-1&color=blue",
                b"ping",
            )
            .unwrap();
        let mut expected = Message::new("ping");
        expected.message_id = Some("m7".into());
        expected
            .custom_properties
            .insert("color".into(), "blue".into());
        assert_eq!(c2d, Event::C2dMessage(expected));

        let input = converter
            .decode("devices/dev-1/modules/filter/inputs/in1/%24.cid=c1", b"{}")
            .unwrap();
        match input {
            Event::InputMessage {
                input_name,
                message,
            } => {
                assert_eq!(input_name, "in1");
                assert_eq!(message.correlation_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let method = converter
            .decode("$iothub/methods/POST/reboot/?$rid=5", br#"{"delay":3}"#)
            .unwrap();
        assert_eq!(
            method,
            Event::MethodRequest(MethodRequest {
                request_id: "5".into(),
                name: "reboot".into(),
                payload: json!({"delay": 3}),
            })
        );

        let response = converter
            .decode("$iothub/twin/res/204/?$rid=r1&$version=4", b"")
            .unwrap();
        assert_eq!(
            response,
            Event::Response {
                request_id: RequestId::from("r1"),
                response: Response::new(204, Value::Null),
            }
        );

        let patch = converter
            .decode(
                "$iothub/twin/PATCH/properties/desired/?$version=5",
                br#"{"interval":10}"#,
            )
            .unwrap();
        assert_eq!(
            patch,
            Event::TwinDesiredPropertiesPatch(json!({"interval": 10}))
        );

        assert!(converter.decode("devices/other/messages/devicebound/", b"").is_none());
    }
}
