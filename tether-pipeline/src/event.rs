use serde_json::Value;

use crate::RequestId;
use crate::model::{Message, MethodRequest, Response};

/// A notification travelling up the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Reply to a correlated request
    Response {
        request_id: RequestId,
        response: Response,
    },
    IncomingMqttMessage {
        topic: String,
        payload: Vec<u8>,
    },
    Connected,
    Disconnected,
    C2dMessage(Message),
    InputMessage {
        input_name: String,
        message: Message,
    },
    MethodRequest(MethodRequest),
    TwinDesiredPropertiesPatch(Value),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Response { .. } => "Response",
            Event::IncomingMqttMessage { .. } => "IncomingMqttMessage",
            Event::Connected => "Connected",
            Event::Disconnected => "Disconnected",
            Event::C2dMessage(_) => "C2dMessage",
            Event::InputMessage { .. } => "InputMessage",
            Event::MethodRequest(_) => "MethodRequest",
            Event::TwinDesiredPropertiesPatch(_) => "TwinDesiredPropertiesPatch",
        }
    }
}
