//! Direct method invocation through an Edge gateway.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use tether_pipeline::http::{HttpTransport, HttpTransportConfig};
use tether_pipeline::{
    AuthProvider, AuthProviderArgs, Context, MethodParams, OpKind, Operation, PipelineBuilder,
    PipelineError, PipelineHandle, Stage,
};

const API_VERSION: &str = "2018-09-30";

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("Method invocation failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Gateway returned error: ({0}) {1}")]
    Status(u16, Value),

    #[error("Response decoding failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Outcome of a method invoked on another device or module
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MethodResult {
    pub status: i32,
    #[serde(default)]
    pub payload: Value,
}

/// Turns an auth provider into the gateway connection arguments
///
/// Only the gateway hostname and its CA certificate are used, requests go
/// to the gateway rather than the hub.
#[derive(Default)]
pub struct EdgeAuthStage;

impl Stage for EdgeAuthStage {
    fn name(&self) -> &'static str {
        "EdgeAuthStage"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        let OpKind::SetAuthProvider(provider) = &op.kind else {
            return ctx.send_op_down(op);
        };
        if provider.gateway_hostname.is_none() {
            let err = PipelineError::InvalidState("Edge requires a gateway hostname".into());
            return ctx.complete(op, Err(err));
        }

        let args = AuthProviderArgs::from(provider);
        ctx.delegate(op, Operation::new(OpKind::SetAuthProviderArgs(args)));
    }
}

/// Converts Edge operations into HTTP operations
#[derive(Default)]
pub struct EdgeHttpConverter;

fn methods_url(device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(module_id) => format!("/twins/{device_id}/modules/{module_id}/methods"),
        None => format!("/twins/{device_id}/methods"),
    }
}

impl Stage for EdgeHttpConverter {
    fn name(&self) -> &'static str {
        "EdgeHttpConverter"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        let kind = match &op.kind {
            OpKind::SetAuthProviderArgs(args) => match &args.gateway_hostname {
                Some(gateway_hostname) => OpKind::SetHttpConnectionArgs {
                    hostname: gateway_hostname.clone(),
                    ca_cert: args.ca_cert.clone(),
                },
                None => {
                    let err = PipelineError::InvalidState("no gateway hostname".into());
                    return ctx.complete(op, Err(err));
                }
            },
            OpKind::InvokeMethod {
                device_id,
                module_id,
                params,
            } => {
                let body = match serde_json::to_value(params) {
                    Ok(body) => body,
                    Err(err) => {
                        return ctx.complete(op, Err(PipelineError::Protocol(err.to_string())));
                    }
                };
                OpKind::HttpPost {
                    url: methods_url(device_id, module_id.as_deref()),
                    params: vec![("api-version".into(), API_VERSION.into())],
                    body,
                }
            }
            _ => return ctx.send_op_down(op),
        };
        ctx.delegate(op, Operation::new(kind));
    }
}

/// Invokes methods on devices and modules behind an Edge gateway
pub struct EdgeClient {
    pipeline: PipelineHandle,
}

impl EdgeClient {
    pub async fn create(
        auth_provider: AuthProvider,
        config: HttpTransportConfig,
    ) -> Result<Self, EdgeError> {
        let pipeline = PipelineBuilder::new()
            .append_stage(EdgeAuthStage)
            .append_stage(EdgeHttpConverter)
            .append_stage(HttpTransport::new(config))
            .spawn();

        pipeline
            .submit(OpKind::SetAuthProvider(auth_provider))
            .await?;

        Ok(Self { pipeline })
    }

    #[instrument(skip(self, params), fields(method = %params.method_name), err)]
    pub async fn invoke_method(
        &self,
        device_id: &str,
        module_id: Option<&str>,
        params: MethodParams,
    ) -> Result<MethodResult, EdgeError> {
        let response = self
            .pipeline
            .submit(OpKind::InvokeMethod {
                device_id: device_id.to_owned(),
                module_id: module_id.map(str::to_owned),
                params,
            })
            .await?
            .ok_or_else(|| PipelineError::Protocol("no response from gateway".into()))?;

        debug!(status = response.status_code, "method invoked");
        if !response.is_success() {
            return Err(EdgeError::Status(response.status_code, response.body));
        }
        Ok(serde_json::from_value(response.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mockito::Matcher;
    use serde_json::json;
    use std::time::Duration;
    use tether_pipeline::Credential;

    fn auth_provider(gateway_hostname: Option<String>) -> AuthProvider {
        AuthProvider {
            device_id: "edge-dev".into(),
            module_id: Some("caller".into()),
            hostname: "hub.example.net".into(),
            gateway_hostname,
            ca_cert: None,
            credential: Credential::SasToken("SharedAccessSignature sr=x".into()),
        }
    }

    fn http_config() -> HttpTransportConfig {
        HttpTransportConfig {
            scheme: "http".into(),
            timeout: Duration::from_secs(5),
        }
    }

    fn reboot() -> MethodParams {
        MethodParams {
            method_name: "reboot".into(),
            payload: json!({"delay": 5}),
            response_timeout_secs: Some(30),
            connect_timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn test_invoke_module_method() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/twins/dev-2/modules/filter/methods")
            .match_query(Matcher::UrlEncoded(
                "api-version".into(),
                "2018-09-30".into(),
            ))
            .match_body(Matcher::Json(json!({
                "methodName": "reboot",
                "payload": {"delay": 5},
                "responseTimeoutInSeconds": 30
            })))
            .with_status(200)
            .with_body(r#"{"status":200,"payload":{"rebooting":true}}"#)
            .create_async()
            .await;

        let client = EdgeClient::create(auth_provider(Some(server.host_with_port())), http_config())
            .await
            .unwrap();
        let result = client
            .invoke_method("dev-2", Some("filter"), reboot())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(
            result,
            MethodResult {
                status: 200,
                payload: json!({"rebooting": true}),
            }
        );
    }

    #[tokio::test]
    async fn test_gateway_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/twins/dev-2/methods")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"message":"device not found"}"#)
            .create_async()
            .await;

        let client = EdgeClient::create(auth_provider(Some(server.host_with_port())), http_config())
            .await
            .unwrap();
        let res = client.invoke_method("dev-2", None, reboot()).await;

        assert!(matches!(res, Err(EdgeError::Status(404, _))));
    }

    #[tokio::test]
    async fn test_gateway_hostname_is_required() {
        let res = EdgeClient::create(auth_provider(None), http_config()).await;
        assert!(matches!(
            res,
            Err(EdgeError::Pipeline(PipelineError::InvalidState(_)))
        ));
    }
}
