use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a correlated request is asking the service for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestType {
    /// Device twin get/patch
    Twin,
    /// Initial provisioning registration
    Register,
    /// Status query for an ongoing provisioning operation
    Query { operation_id: String },
}

/// A request expecting an asynchronous response from the service
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_type: RequestType,
    pub method: String,
    pub resource_location: String,
    pub body: Value,
}

/// The service reply to a [`Request`]
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status_code: u16,
    pub body: Value,

    /// Delay the service asks the device to wait before its next request
    pub retry_after: Option<Duration>,
}

impl Response {
    pub fn new(status_code: u16, body: Value) -> Self {
        Self {
            status_code,
            body,
            retry_after: None,
        }
    }

    pub fn with_retry_after(self, retry_after: Duration) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..self
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// PEM encoded client certificate and key
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    pub certificate: String,
    pub private_key: String,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("certificate", &self.certificate)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Credential material a device authenticates with
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    SasToken(String),
    X509(Certificate),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::SasToken(_) => f.write_str("SasToken(<redacted>)"),
            Credential::X509(cert) => f.debug_tuple("X509").field(cert).finish(),
        }
    }
}

/// Identity used to register with the provisioning service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityClient {
    pub provisioning_host: String,
    pub registration_id: String,
    pub id_scope: String,

    /// PEM encoded CA to trust for the service, required with X.509
    /// credentials
    pub ca_cert: Option<String>,
    pub credential: Credential,
}

/// Identity used to talk to a hub, directly or through an Edge gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthProvider {
    pub device_id: String,
    pub module_id: Option<String>,
    pub hostname: String,
    pub gateway_hostname: Option<String>,
    pub ca_cert: Option<String>,
    pub credential: Credential,
}

/// Connection arguments derived from an [`AuthProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthProviderArgs {
    pub device_id: String,
    pub module_id: Option<String>,
    pub hostname: String,
    pub gateway_hostname: Option<String>,
    pub ca_cert: Option<String>,
}

impl From<&AuthProvider> for AuthProviderArgs {
    fn from(provider: &AuthProvider) -> Self {
        Self {
            device_id: provider.device_id.clone(),
            module_id: provider.module_id.clone(),
            hostname: provider.hostname.clone(),
            gateway_hostname: provider.gateway_hostname.clone(),
            ca_cert: provider.ca_cert.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConnectionArgs {
    pub client_id: String,
    pub hostname: String,
    pub username: String,
    pub ca_cert: Option<String>,
}

/// A device-to-cloud or cloud-to-device message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub data: Vec<u8>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub output_name: Option<String>,
    pub custom_properties: BTreeMap<String, String>,
}

impl Message {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }
}

/// Direct method invocation received from the service
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRequest {
    pub request_id: String,
    pub name: String,
    pub payload: Value,
}

/// Device reply to a [`MethodRequest`]
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    pub request_id: String,
    pub status: u16,
    pub payload: Value,
}

/// Parameters for invoking a method on another device or module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodParams {
    pub method_name: String,
    pub payload: Value,
    #[serde(
        rename = "responseTimeoutInSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub response_timeout_secs: Option<u64>,
    #[serde(
        rename = "connectTimeoutInSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub connect_timeout_secs: Option<u64>,
}
