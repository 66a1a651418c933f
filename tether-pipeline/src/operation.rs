use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::error::PipelineError;
use crate::model::*;
use crate::RequestId;

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

impl OpId {
    fn next() -> Self {
        Self(NEXT_OP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// The command carried by an [`Operation`]
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Connect,
    Disconnect,
    Reconnect,
    EnableFeature {
        feature: String,
    },
    DisableFeature {
        feature: String,
    },
    SetSasToken {
        sas_token: String,
    },
    SetCertificate {
        certificate: Certificate,
    },

    /// Fire a request whose response arrives later as an event
    SendRequest {
        request: Request,
        request_id: RequestId,
    },
    /// Send a request and complete once its response arrives
    SendRequestAndWait {
        request: Request,
    },
    /// Abandon a pending [`OpKind::SendRequestAndWait`]
    CancelRequest {
        target: OpId,
    },

    SetHttpConnectionArgs {
        hostname: String,
        ca_cert: Option<String>,
    },
    HttpPost {
        url: String,
        params: Vec<(String, String)>,
        body: Value,
    },

    SetMqttConnectionArgs(MqttConnectionArgs),
    MqttPublish {
        topic: String,
        payload: Vec<u8>,
    },
    MqttSubscribe {
        topic: String,
    },
    MqttUnsubscribe {
        topic: String,
    },

    // provisioning
    SetSecurityClient(SecurityClient),
    SetSecurityClientArgs {
        provisioning_host: String,
        registration_id: String,
        id_scope: String,
        ca_cert: Option<String>,
    },
    SendRegistrationRequest {
        request_id: RequestId,
        payload: Value,
    },
    SendQueryRequest {
        request_id: RequestId,
        operation_id: String,
        payload: Value,
    },
    Register {
        payload: Option<Value>,
    },
    CancelRegistration,

    // hub and edge
    SetAuthProvider(AuthProvider),
    SetAuthProviderArgs(AuthProviderArgs),
    SendTelemetry {
        message: Message,
    },
    SendOutputEvent {
        output_name: String,
        message: Message,
    },
    SendMethodResponse(MethodResponse),
    GetTwin,
    PatchTwinReportedProperties {
        patch: Value,
    },
    InvokeMethod {
        device_id: String,
        module_id: Option<String>,
        params: MethodParams,
    },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Connect => "Connect",
            OpKind::Disconnect => "Disconnect",
            OpKind::Reconnect => "Reconnect",
            OpKind::EnableFeature { .. } => "EnableFeature",
            OpKind::DisableFeature { .. } => "DisableFeature",
            OpKind::SetSasToken { .. } => "SetSasToken",
            OpKind::SetCertificate { .. } => "SetCertificate",
            OpKind::SendRequest { .. } => "SendRequest",
            OpKind::SendRequestAndWait { .. } => "SendRequestAndWait",
            OpKind::CancelRequest { .. } => "CancelRequest",
            OpKind::SetHttpConnectionArgs { .. } => "SetHttpConnectionArgs",
            OpKind::HttpPost { .. } => "HttpPost",
            OpKind::SetMqttConnectionArgs(_) => "SetMqttConnectionArgs",
            OpKind::MqttPublish { .. } => "MqttPublish",
            OpKind::MqttSubscribe { .. } => "MqttSubscribe",
            OpKind::MqttUnsubscribe { .. } => "MqttUnsubscribe",
            OpKind::SetSecurityClient(_) => "SetSecurityClient",
            OpKind::SetSecurityClientArgs { .. } => "SetSecurityClientArgs",
            OpKind::SendRegistrationRequest { .. } => "SendRegistrationRequest",
            OpKind::SendQueryRequest { .. } => "SendQueryRequest",
            OpKind::Register { .. } => "Register",
            OpKind::CancelRegistration => "CancelRegistration",
            OpKind::SetAuthProvider(_) => "SetAuthProvider",
            OpKind::SetAuthProviderArgs(_) => "SetAuthProviderArgs",
            OpKind::SendTelemetry { .. } => "SendTelemetry",
            OpKind::SendOutputEvent { .. } => "SendOutputEvent",
            OpKind::SendMethodResponse(_) => "SendMethodResponse",
            OpKind::GetTwin => "GetTwin",
            OpKind::PatchTwinReportedProperties { .. } => "PatchTwinReportedProperties",
            OpKind::InvokeMethod { .. } => "InvokeMethod",
        }
    }

    /// Whether operations of this kind can only run on an open connection
    pub fn needs_connection(&self) -> bool {
        matches!(
            self,
            OpKind::EnableFeature { .. }
                | OpKind::DisableFeature { .. }
                | OpKind::SendRequest { .. }
                | OpKind::SendRequestAndWait { .. }
                | OpKind::MqttPublish { .. }
                | OpKind::MqttSubscribe { .. }
                | OpKind::MqttUnsubscribe { .. }
                | OpKind::SendRegistrationRequest { .. }
                | OpKind::SendQueryRequest { .. }
                | OpKind::SendTelemetry { .. }
                | OpKind::SendOutputEvent { .. }
                | OpKind::SendMethodResponse(_)
                | OpKind::GetTwin
                | OpKind::PatchTwinReportedProperties { .. }
        )
    }
}

/// Where the completion of an operation is routed
pub(crate) enum Handler {
    /// Invoke a closure on the pipeline context
    Callback(Box<dyn FnOnce(Operation) + Send>),

    /// Hand the operation back to the stage at `stage`
    Stage { stage: usize, tag: u64 },

    /// Complete the original operation this one replaced
    Delegated(Box<Operation>),

    /// Run the next of a list of operations from `stage`, or complete
    /// the original once the list is exhausted
    Serial {
        stage: usize,
        original: Box<Operation>,
        remaining: VecDeque<Operation>,
    },
}

/// A command travelling down the pipeline
///
/// Every operation is completed exactly once. Completing an operation a
/// second time is a programming error and panics.
pub struct Operation {
    id: OpId,
    pub kind: OpKind,
    pub needs_connection: bool,

    /// Failure, if the operation completed with an error
    pub error: Option<PipelineError>,

    /// Reply for request style operations
    pub response: Option<Response>,

    completed: bool,
    handler: Option<Handler>,
}

impl Operation {
    pub fn new(kind: OpKind) -> Self {
        Self {
            id: OpId::next(),
            needs_connection: kind.needs_connection(),
            kind,
            error: None,
            response: None,
            completed: false,
            handler: None,
        }
    }

    /// Create an operation invoking `callback` on completion
    pub fn with_callback<F>(kind: OpKind, callback: F) -> Self
    where
        F: FnOnce(Operation) + Send + 'static,
    {
        let mut op = Self::new(kind);
        op.set_handler(Handler::Callback(Box::new(callback)));
        op
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Consume a completed operation into its outcome
    pub fn into_result(mut self) -> Result<Option<Response>, PipelineError> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self.response.take()),
        }
    }

    pub(crate) fn set_handler(&mut self, handler: Handler) {
        assert!(
            self.handler.is_none(),
            "{} {} already has a completion handler",
            self.name(),
            self.id
        );
        self.handler = Some(handler);
    }

    pub(crate) fn take_handler(&mut self) -> Option<Handler> {
        self.handler.take()
    }

    pub(crate) fn mark_complete(&mut self, result: Result<(), PipelineError>) {
        assert!(
            !self.completed,
            "{} {} completed more than once",
            self.name(),
            self.id
        );
        self.completed = true;
        if let Err(err) = result {
            self.error = Some(err);
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("needs_connection", &self.needs_connection)
            .field("error", &self.error)
            .field("response", &self.response)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_operations_need_connection() {
        let op = Operation::new(OpKind::EnableFeature {
            feature: "twin".into(),
        });
        assert!(op.needs_connection);
        assert!(!Operation::new(OpKind::Connect).needs_connection);
        assert!(!Operation::new(OpKind::SetSasToken {
            sas_token: "sig".into()
        })
        .needs_connection);
    }

    #[test]
    fn test_operation_ids_are_unique() {
        let a = Operation::new(OpKind::Connect);
        let b = Operation::new(OpKind::Connect);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    #[should_panic(expected = "completed more than once")]
    fn test_completing_twice_panics() {
        let mut op = Operation::new(OpKind::Connect);
        op.mark_complete(Ok(()));
        op.mark_complete(Err(PipelineError::Timeout));
    }

    #[test]
    #[should_panic(expected = "already has a completion handler")]
    fn test_replacing_handler_panics() {
        let mut op = Operation::with_callback(OpKind::Connect, |_| {});
        op.set_handler(Handler::Stage { stage: 1, tag: 0 });
    }

    #[test]
    fn test_into_result_prefers_error() {
        let mut op = Operation::new(OpKind::GetTwin);
        op.response = Some(Response::new(200, Value::Null));
        op.mark_complete(Err(PipelineError::Cancelled));
        assert_eq!(op.into_result(), Err(PipelineError::Cancelled));
    }
}
