//! Device registration with a provisioning service.
//!
//! Registration is a multi-round handshake: the device sends a registration
//! request, and while the service is still assigning it polls the operation
//! status at the interval the service asks for. [`PollingMachine`] drives
//! that handshake as the topmost stage of a provisioning pipeline, and
//! [`ProvisioningClient`] wraps the whole pipeline behind `register` and
//! `cancel`.

mod client;
mod config;
mod models;
mod mqtt;
mod polling;
mod requests;
mod security;

pub use client::{ProvisioningClient, ProvisioningError};
pub use config::{PollingConfig, ProvisioningConfig, RegistrationRecord};
pub use models::{RegistrationResult, RegistrationState, RegistrationStatus};
pub use mqtt::ProvisioningMqttConverter;
pub use polling::{PollingMachine, PollingState};
pub use requests::ProvisioningRequestStage;
pub use security::SecurityClientStage;
