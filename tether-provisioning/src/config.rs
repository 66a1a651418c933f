use serde::{Deserialize, Serialize};
use std::time::Duration;

use tether_pipeline::CorrelationConfig;
use tether_pipeline::mqtt::MqttTransportConfig;
use tether_util::config::StoredConfig;
use tether_util::json::{deserialize_duration_from_ms, serialize_duration_to_ms};

use crate::models::RegistrationResult;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PollingConfig {
    /// Poll interval used when the service does not ask for one
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub default_poll_interval: Duration,

    /// Shortest interval between two requests, whatever the service asks
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub min_poll_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_poll_interval: Duration::from_millis(2_000),
            min_poll_interval: Duration::from_millis(1_000),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProvisioningConfig {
    pub polling: PollingConfig,
    pub correlation: CorrelationConfig,
    pub mqtt: MqttTransportConfig,
}

// Persisted to disk: keep changes backwards compatible or devices lose the
// identity they were assigned.
/// Outcome of a successful registration
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RegistrationRecord {
    pub provisioning_host: String,
    pub id_scope: String,
    pub registration_id: String,
    pub result: RegistrationResult,
}

impl StoredConfig for RegistrationRecord {
    fn kind() -> &'static str {
        "registration"
    }
}
