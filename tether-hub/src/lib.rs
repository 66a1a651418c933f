//! Hub and Edge clients built on the stage pipeline.
//!
//! [`HubClient`] talks to a hub over MQTT: telemetry, output events, direct
//! methods, cloud-to-device and input messages, and the device twin.
//! [`EdgeClient`] invokes direct methods on other devices and modules
//! through an Edge gateway over HTTP.

mod auth;
mod client;
mod config;
mod edge;
mod feature;
mod mqtt;
mod twin;

pub use auth::AuthProviderStage;
pub use client::{HubClient, HubClientBuilder, HubError};
pub use config::HubConfig;
pub use edge::{EdgeAuthStage, EdgeClient, EdgeError, EdgeHttpConverter, MethodResult};
pub use feature::{Feature, FeatureStage, FeatureTable};
pub use mqtt::HubMqttConverter;
pub use twin::TwinStage;
