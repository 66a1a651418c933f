use serde::{Deserialize, Serialize};

use tether_pipeline::CorrelationConfig;
use tether_pipeline::http::HttpTransportConfig;
use tether_pipeline::mqtt::MqttTransportConfig;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct HubConfig {
    pub correlation: CorrelationConfig,
    pub mqtt: MqttTransportConfig,

    /// Used by the Edge client only
    pub http: HttpTransportConfig,
}
