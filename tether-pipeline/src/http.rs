//! HTTP leaf transport backed by reqwest.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Span, debug, field, instrument};

use tether_util::json::{deserialize_duration_from_ms, serialize_duration_to_ms};

use crate::error::PipelineError;
use crate::model::Response;
use crate::operation::{OpKind, Operation};
use crate::stage::{Context, Stage};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct HttpTransportConfig {
    /// URL scheme used to reach the configured host
    pub scheme: String,

    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            scheme: "https".into(),
            timeout: Duration::from_millis(30_000),
        }
    }
}

/// Leaf stage performing HTTP requests
///
/// Requests complete with the service status and body in
/// [`Operation::response`], whatever the status code.
#[derive(Default)]
pub struct HttpTransport {
    config: HttpTransportConfig,
    client: Option<(Client, String)>,
}

fn transport_error(err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Transport(err.to_string())
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    fn set_connection_args(
        &mut self,
        hostname: &str,
        ca_cert: Option<&str>,
    ) -> Result<(), PipelineError> {
        let mut builder = Client::builder().timeout(self.config.timeout);
        if let Some(pem) = ca_cert {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes()).map_err(transport_error)?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().map_err(transport_error)?;
        self.client = Some((client, hostname.to_owned()));
        Ok(())
    }

    fn post(&self, ctx: &mut Context<'_>, mut op: Operation) {
        let Some((client, hostname)) = &self.client else {
            return ctx.complete(op, Err(transport_error("connection arguments were not set")));
        };
        let Some(handle) = ctx.handle() else {
            return ctx.complete(op, Err(PipelineError::Shutdown));
        };
        let request = match &op.kind {
            OpKind::HttpPost { url, params, body } => {
                let endpoint = format!("{}://{}{}", self.config.scheme, hostname, url);
                client.post(endpoint).query(params).json(body)
            }
            _ => return ctx.send_op_down(op),
        };

        tokio::spawn(async move {
            match send(request).await {
                Ok(response) => {
                    op.response = Some(response);
                    handle.complete(op, Ok(()));
                }
                Err(err) => handle.complete(op, Err(err)),
            }
        });
    }
}

#[instrument(skip_all, fields(status = field::Empty), err)]
async fn send(request: reqwest::RequestBuilder) -> Result<Response, PipelineError> {
    debug!("calling remote");
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    Span::current().record("status", field::display(status));

    let bytes = response.bytes().await.map_err(transport_error)?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };

    Ok(Response::new(status.as_u16(), body))
}

impl Stage for HttpTransport {
    fn name(&self) -> &'static str {
        "HttpTransport"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        match &op.kind {
            OpKind::SetHttpConnectionArgs { hostname, ca_cert } => {
                let res = self.set_connection_args(hostname, ca_cert.as_deref());
                ctx.complete(op, res);
            }
            OpKind::HttpPost { .. } => self.post(ctx, op),
            _ => ctx.send_op_down(op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mockito::Matcher;
    use serde_json::json;

    use crate::pipeline::{PipelineBuilder, PipelineHandle};

    async fn http_pipeline(host: String) -> PipelineHandle {
        let pipeline = PipelineBuilder::new()
            .append_stage(HttpTransport::new(HttpTransportConfig {
                scheme: "http".into(),
                timeout: Duration::from_secs(5),
            }))
            .spawn();
        pipeline
            .submit(OpKind::SetHttpConnectionArgs {
                hostname: host,
                ca_cert: None,
            })
            .await
            .unwrap();
        pipeline
    }

    #[tokio::test]
    async fn test_post_returns_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/twins/dev-1/methods")
            .match_query(Matcher::UrlEncoded(
                "api-version".into(),
                "2018-09-30".into(),
            ))
            .match_body(Matcher::Json(json!({"methodName": "reboot"})))
            .with_status(200)
            .with_body(r#"{"status":200,"payload":{"ok":true}}"#)
            .create_async()
            .await;

        let pipeline = http_pipeline(server.host_with_port()).await;
        let response = pipeline
            .submit(OpKind::HttpPost {
                url: "/twins/dev-1/methods".into(),
                params: vec![("api-version".into(), "2018-09-30".into())],
                body: json!({"methodName": "reboot"}),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(
            response,
            Some(Response::new(
                200,
                json!({"status": 200, "payload": {"ok": true}})
            ))
        );
    }

    #[tokio::test]
    async fn test_error_status_is_not_a_transport_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/fail")
            .with_status(404)
            .with_body("not found")
            .create_async()
            .await;

        let pipeline = http_pipeline(server.host_with_port()).await;
        let response = pipeline
            .submit(OpKind::HttpPost {
                url: "/fail".into(),
                params: vec![],
                body: json!({}),
            })
            .await
            .unwrap();

        assert_eq!(response, Some(Response::new(404, json!("not found"))));
    }

    #[tokio::test]
    async fn test_post_without_connection_args_fails() {
        let pipeline = PipelineBuilder::new()
            .append_stage(HttpTransport::default())
            .spawn();

        let res = pipeline
            .submit(OpKind::HttpPost {
                url: "/".into(),
                params: vec![],
                body: json!({}),
            })
            .await;
        assert!(matches!(res, Err(PipelineError::Transport(_))));
    }
}
