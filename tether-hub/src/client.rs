use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{instrument, warn};

use tether_pipeline::mqtt::MqttTransport;
use tether_pipeline::{
    AuthProvider, ConnectionStage, CorrelationStage, Event, Message, MethodRequest,
    MethodResponse, OpKind, PipelineBuilder, PipelineError, PipelineHandle, Response, Stage,
};

use crate::auth::AuthProviderStage;
use crate::config::HubConfig;
use crate::feature::{Feature, FeatureStage, FeatureTable};
use crate::mqtt::HubMqttConverter;
use crate::twin::TwinStage;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Hub operation failed: {0}")]
    Pipeline(#[from] PipelineError),
}

type Hook = Box<dyn FnMut() + Send>;
type Handler<T> = Box<dyn FnMut(T) + Send>;
type InputHandler = Box<dyn FnMut(String, Message) + Send>;

#[derive(Default)]
struct EventHandlers {
    on_c2d_message: Option<Handler<Message>>,
    on_input_message: Option<InputHandler>,
    on_method_request: Option<Handler<MethodRequest>>,
    on_twin_patch: Option<Handler<Value>>,
}

impl EventHandlers {
    fn dispatch(&mut self, event: Event) {
        match event {
            Event::C2dMessage(message) => match self.on_c2d_message.as_mut() {
                Some(handler) => handler(message),
                None => warn!("C2D message received with no handler, dropping"),
            },
            Event::InputMessage {
                input_name,
                message,
            } => match self.on_input_message.as_mut() {
                Some(handler) => handler(input_name, message),
                None => warn!(%input_name, "input message received with no handler, dropping"),
            },
            Event::MethodRequest(request) => match self.on_method_request.as_mut() {
                Some(handler) => handler(request),
                None => warn!(method = %request.name, "method request received with no handler, dropping"),
            },
            Event::TwinDesiredPropertiesPatch(patch) => match self.on_twin_patch.as_mut() {
                Some(handler) => handler(patch),
                None => warn!("twin patch received with no handler, dropping"),
            },
            event => warn!(event = event.name(), "dropping unknown event"),
        }
    }
}

/// Configures the handlers of a [`HubClient`]
///
/// Handlers run on the pipeline context and must not block.
pub struct HubClientBuilder {
    config: HubConfig,
    handlers: EventHandlers,
    on_connected: Option<Hook>,
    on_disconnected: Option<Hook>,
}

impl HubClientBuilder {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            handlers: EventHandlers::default(),
            on_connected: None,
            on_disconnected: None,
        }
    }

    pub fn on_connected(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.on_connected = Some(Box::new(hook));
        self
    }

    pub fn on_disconnected(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.on_disconnected = Some(Box::new(hook));
        self
    }

    pub fn on_c2d_message(mut self, handler: impl FnMut(Message) + Send + 'static) -> Self {
        self.handlers.on_c2d_message = Some(Box::new(handler));
        self
    }

    pub fn on_input_message(
        mut self,
        handler: impl FnMut(String, Message) + Send + 'static,
    ) -> Self {
        self.handlers.on_input_message = Some(Box::new(handler));
        self
    }

    pub fn on_method_request(
        mut self,
        handler: impl FnMut(MethodRequest) + Send + 'static,
    ) -> Self {
        self.handlers.on_method_request = Some(Box::new(handler));
        self
    }

    pub fn on_twin_patch(mut self, handler: impl FnMut(Value) + Send + 'static) -> Self {
        self.handlers.on_twin_patch = Some(Box::new(handler));
        self
    }

    /// Build a client speaking MQTT to the hub
    pub async fn create(self, auth_provider: AuthProvider) -> Result<HubClient, HubError> {
        let transport = MqttTransport::new(self.config.mqtt.clone());
        self.with_transport(auth_provider, transport).await
    }

    /// Build a client on top of the given leaf transport
    pub async fn with_transport<T: Stage>(
        self,
        auth_provider: AuthProvider,
        transport: T,
    ) -> Result<HubClient, HubError> {
        let (features, feature_table) = FeatureStage::new();
        let mut handlers = self.handlers;

        let mut builder = PipelineBuilder::new().on_event(move |event| handlers.dispatch(event));
        if let Some(hook) = self.on_connected {
            builder = builder.on_connected(hook);
        }
        if let Some(hook) = self.on_disconnected {
            builder = builder.on_disconnected(hook);
        }

        let pipeline = builder
            .append_stage(features)
            .append_stage(AuthProviderStage)
            .append_stage(TwinStage::new())
            .append_stage(CorrelationStage::new(self.config.correlation))
            .append_stage(ConnectionStage::new())
            .append_stage(HubMqttConverter::new())
            .append_stage(transport)
            .spawn();

        pipeline
            .submit(OpKind::SetAuthProvider(auth_provider))
            .await?;

        Ok(HubClient {
            pipeline,
            features: feature_table,
        })
    }
}

/// Device or module client of a hub
pub struct HubClient {
    pipeline: PipelineHandle,
    features: watch::Receiver<FeatureTable>,
}

impl HubClient {
    pub fn builder(config: HubConfig) -> HubClientBuilder {
        HubClientBuilder::new(config)
    }

    async fn run(&self, kind: OpKind) -> Result<Option<Response>, HubError> {
        Ok(self.pipeline.submit(kind).await?)
    }

    #[instrument(skip_all, err)]
    pub async fn connect(&self) -> Result<(), HubError> {
        self.run(OpKind::Connect).await?;
        Ok(())
    }

    #[instrument(skip_all, err)]
    pub async fn disconnect(&self) -> Result<(), HubError> {
        self.run(OpKind::Disconnect).await?;
        Ok(())
    }

    #[instrument(skip_all, err)]
    pub async fn reconnect(&self) -> Result<(), HubError> {
        self.run(OpKind::Reconnect).await?;
        Ok(())
    }

    /// Send a device-to-cloud message, connecting first if needed
    #[instrument(skip_all, err)]
    pub async fn send_telemetry(&self, message: Message) -> Result<(), HubError> {
        self.run(OpKind::SendTelemetry { message }).await?;
        Ok(())
    }

    /// Send a message on a module output
    #[instrument(skip(self, message), err)]
    pub async fn send_output_event(
        &self,
        output_name: &str,
        message: Message,
    ) -> Result<(), HubError> {
        self.run(OpKind::SendOutputEvent {
            output_name: output_name.to_owned(),
            message,
        })
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(request_id = %response.request_id), err)]
    pub async fn send_method_response(&self, response: MethodResponse) -> Result<(), HubError> {
        self.run(OpKind::SendMethodResponse(response)).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn enable_feature(&self, feature: Feature) -> Result<(), HubError> {
        self.run(OpKind::EnableFeature {
            feature: feature.to_string(),
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn disable_feature(&self, feature: Feature) -> Result<(), HubError> {
        self.run(OpKind::DisableFeature {
            feature: feature.to_string(),
        })
        .await?;
        Ok(())
    }

    pub fn feature_enabled(&self, feature: Feature) -> bool {
        self.features.borrow().is_enabled(feature)
    }

    async fn ensure_twin_enabled(&self) -> Result<(), HubError> {
        if !self.feature_enabled(Feature::Twin) {
            self.enable_feature(Feature::Twin).await?;
        }
        Ok(())
    }

    /// Fetch the full twin document
    #[instrument(skip_all, err)]
    pub async fn get_twin(&self) -> Result<Value, HubError> {
        self.ensure_twin_enabled().await?;
        let response = self.run(OpKind::GetTwin).await?;
        Ok(response.map(|r| r.body).unwrap_or_default())
    }

    #[instrument(skip_all, err)]
    pub async fn patch_twin_reported_properties(&self, patch: Value) -> Result<(), HubError> {
        self.ensure_twin_enabled().await?;
        self.run(OpKind::PatchTwinReportedProperties { patch })
            .await?;
        Ok(())
    }
}
