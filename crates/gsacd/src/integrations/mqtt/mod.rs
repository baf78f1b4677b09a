mod bus;
mod client;
mod config;
mod topic;

pub use bus::Bus;
pub use bus::Subscriber;
pub use bus::Subscription;
pub use client::ClientError;
pub use client::MessageStream;
pub use client::MqttClient;
pub use client::MqttMessage;
pub use client::RumqttcClient;
#[cfg(test)]
pub use client::MockHandle;
#[cfg(test)]
pub use client::MockMqttClient;
pub use config::Config as MqttConfig;
pub use rumqttc::QoS;
pub use topic::matches as topic_matches;
