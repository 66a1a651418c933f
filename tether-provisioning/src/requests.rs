use tether_pipeline::{Context, OpKind, Operation, RequestType, Stage};

/// Translates generic requests into provisioning specific operations
#[derive(Default)]
pub struct ProvisioningRequestStage;

impl Stage for ProvisioningRequestStage {
    fn name(&self) -> &'static str {
        "ProvisioningRequestStage"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        let OpKind::SendRequest {
            request,
            request_id,
        } = &op.kind
        else {
            return ctx.send_op_down(op);
        };

        let kind = match &request.request_type {
            RequestType::Register => OpKind::SendRegistrationRequest {
                request_id: request_id.clone(),
                payload: request.body.clone(),
            },
            RequestType::Query { operation_id } => OpKind::SendQueryRequest {
                request_id: request_id.clone(),
                operation_id: operation_id.clone(),
                payload: request.body.clone(),
            },
            RequestType::Twin => return ctx.send_op_down(op),
        };
        ctx.delegate(op, Operation::new(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tether_pipeline::testing::channel_transport;
    use tether_pipeline::{PipelineBuilder, PipelineError, Request, RequestId};

    fn send(request_type: RequestType, request_id: &str) -> OpKind {
        OpKind::SendRequest {
            request: Request {
                request_type,
                method: "PUT".into(),
                resource_location: "/".into(),
                body: json!({"registrationId": "dev-1"}),
            },
            request_id: RequestId::from(request_id),
        }
    }

    #[tokio::test]
    async fn test_register_becomes_registration_request() {
        let (transport, mut monitor) = channel_transport();
        let pipeline = PipelineBuilder::new()
            .append_stage(ProvisioningRequestStage)
            .append_stage(transport)
            .spawn();

        let pending = pipeline.submit(send(RequestType::Register, "r1"));
        let op = monitor.expect_op("SendRegistrationRequest").await;
        assert_eq!(
            op.kind,
            OpKind::SendRegistrationRequest {
                request_id: RequestId::from("r1"),
                payload: json!({"registrationId": "dev-1"}),
            }
        );
        pipeline.complete(op, Err(PipelineError::Transport("not connected".into())));

        // the outcome is copied back to the original request
        assert_eq!(
            pending.await,
            Err(PipelineError::Transport("not connected".into()))
        );
    }

    #[tokio::test]
    async fn test_query_carries_operation_id() {
        let (transport, mut monitor) = channel_transport();
        let pipeline = PipelineBuilder::new()
            .append_stage(ProvisioningRequestStage)
            .append_stage(transport)
            .spawn();

        let pending = pipeline.submit(send(
            RequestType::Query {
                operation_id: "op1".into(),
            },
            "r2",
        ));
        let op = monitor.expect_op("SendQueryRequest").await;
        match &op.kind {
            OpKind::SendQueryRequest {
                request_id,
                operation_id,
                ..
            } => {
                assert_eq!(request_id, &RequestId::from("r2"));
                assert_eq!(operation_id, "op1");
            }
            _ => unreachable!(),
        }
        pipeline.complete(op, Ok(()));
        assert!(pending.await.is_ok());
    }

    #[tokio::test]
    async fn test_twin_request_passes_through() {
        let (transport, mut monitor) = channel_transport();
        let pipeline = PipelineBuilder::new()
            .append_stage(ProvisioningRequestStage)
            .append_stage(transport)
            .spawn();

        let _pending = pipeline.submit(send(RequestType::Twin, "r3"));
        monitor.expect_op("SendRequest").await;
    }
}
