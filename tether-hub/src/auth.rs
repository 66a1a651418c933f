use tracing::debug;

use tether_pipeline::{AuthProviderArgs, Context, Credential, OpKind, Operation, Stage};

/// Splits an auth provider into connection arguments and credentials
#[derive(Default)]
pub struct AuthProviderStage;

impl Stage for AuthProviderStage {
    fn name(&self) -> &'static str {
        "AuthProviderStage"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        let OpKind::SetAuthProvider(provider) = &op.kind else {
            return ctx.send_op_down(op);
        };

        debug!(device_id = %provider.device_id, module_id = ?provider.module_id, "setting auth provider");
        let args = Operation::new(OpKind::SetAuthProviderArgs(AuthProviderArgs::from(provider)));
        let credential = match &provider.credential {
            Credential::SasToken(sas_token) => Operation::new(OpKind::SetSasToken {
                sas_token: sas_token.clone(),
            }),
            Credential::X509(certificate) => Operation::new(OpKind::SetCertificate {
                certificate: certificate.clone(),
            }),
        };

        ctx.run_ops_serial(op, vec![args, credential]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tether_pipeline::testing::channel_transport;
    use tether_pipeline::{AuthProvider, PipelineBuilder, PipelineError};

    #[tokio::test]
    async fn test_auth_provider_sets_args_then_credential() {
        let (transport, mut monitor) = channel_transport();
        let pipeline = PipelineBuilder::new()
            .append_stage(AuthProviderStage)
            .append_stage(transport)
            .spawn();

        let provider = AuthProvider {
            device_id: "dev-1".into(),
            module_id: Some("filter".into()),
            hostname: "hub.example.net".into(),
            gateway_hostname: None,
            ca_cert: None,
            credential: Credential::SasToken("SharedAccessSignature sr=x".into()),
        };
        let pending = pipeline.submit(OpKind::SetAuthProvider(provider.clone()));

        let args = monitor.expect_op("SetAuthProviderArgs").await;
        assert_eq!(
            args.kind,
            OpKind::SetAuthProviderArgs(AuthProviderArgs::from(&provider))
        );
        pipeline.complete(args, Ok(()));

        let token = monitor.expect_op("SetSasToken").await;
        pipeline.complete(token, Err(PipelineError::InvalidState("expired".into())));

        assert_eq!(
            pending.await,
            Err(PipelineError::InvalidState("expired".into()))
        );
    }
}
