use serde::Deserialize;
use serde::Serialize;

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "gsacd".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

/// Configuration for the MQTT connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// MQTT broker hostname or IP address
    pub broker: String,

    /// MQTT broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// MQTT client ID
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Optional username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password for authentication
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}
