use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{instrument, warn};

use tether_pipeline::mqtt::MqttTransport;
use tether_pipeline::{
    ConnectionStage, CorrelationStage, OpKind, PipelineBuilder, PipelineError, PipelineHandle,
    SecurityClient, Stage,
};

use crate::config::ProvisioningConfig;
use crate::models::RegistrationResult;
use crate::mqtt::ProvisioningMqttConverter;
use crate::polling::{PollingMachine, PollingState};
use crate::requests::ProvisioningRequestStage;
use crate::security::SecurityClientStage;

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Registration failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Registration result decoding failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Registers a device with the provisioning service
pub struct ProvisioningClient {
    pipeline: PipelineHandle,
    state: watch::Receiver<PollingState>,
}

impl ProvisioningClient {
    /// Build a provisioning pipeline speaking MQTT and hand it the security
    /// client
    pub async fn create(
        security_client: SecurityClient,
        config: ProvisioningConfig,
    ) -> Result<Self, ProvisioningError> {
        let transport = MqttTransport::new(config.mqtt.clone());
        Self::with_transport(security_client, config, transport).await
    }

    /// Build a provisioning pipeline on top of the given leaf transport
    pub async fn with_transport<T: Stage>(
        security_client: SecurityClient,
        config: ProvisioningConfig,
        transport: T,
    ) -> Result<Self, ProvisioningError> {
        let (machine, state) = PollingMachine::new(config.polling);
        let pipeline = PipelineBuilder::new()
            .append_stage(machine)
            .append_stage(SecurityClientStage)
            .append_stage(CorrelationStage::new(config.correlation))
            .append_stage(ProvisioningRequestStage)
            .append_stage(ConnectionStage::new())
            .append_stage(ProvisioningMqttConverter)
            .append_stage(transport)
            .spawn();

        pipeline
            .submit(OpKind::SetSecurityClient(security_client))
            .await?;

        Ok(Self { pipeline, state })
    }

    /// Register the device, optionally sending a custom payload to the
    /// allocation policy, and wait until the service assigns it.
    ///
    /// The connection is closed once the registration reaches an outcome.
    #[instrument(skip_all, err)]
    pub async fn register(
        &self,
        payload: Option<Value>,
    ) -> Result<RegistrationResult, ProvisioningError> {
        let outcome = self.pipeline.submit(OpKind::Register { payload }).await;

        if matches!(self.state(), PollingState::Assigned | PollingState::Failed)
            && let Err(err) = self.pipeline.submit(OpKind::Disconnect).await
        {
            warn!("failed to disconnect: {err}");
        }

        let response = outcome?.ok_or_else(|| {
            PipelineError::Protocol("registration completed without a response".into())
        })?;
        Ok(serde_json::from_value(response.body)?)
    }

    /// Abandon an ongoing registration.
    ///
    /// The pending [`ProvisioningClient::register`] call fails with
    /// [`PipelineError::Cancelled`].
    #[instrument(skip_all, err)]
    pub async fn cancel(&self) -> Result<(), ProvisioningError> {
        self.pipeline.submit(OpKind::CancelRegistration).await?;
        Ok(())
    }

    pub fn state(&self) -> PollingState {
        *self.state.borrow()
    }
}
