//! Adding a device: identifier validation and the broker probe.
//!
//! The probe only listens. It never publishes, so probing an identifier
//! cannot create topics on the broker.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::device_id::DeviceId;
use super::device_id::DeviceIdError;
use super::topics::Topics;
use crate::config::DeviceEntry;
use crate::config::DEVICE_RECORD_VERSION;
use crate::integrations::mqtt::Bus;
use crate::integrations::mqtt::ClientError;
use crate::integrations::mqtt::MqttMessage;
use crate::integrations::mqtt::QoS;
use crate::integrations::mqtt::Subscriber;
use crate::integrations::mqtt::Subscription;

/// Form field every identifier error is reported against
pub const FIELD_DEVICE_ID: &str = "device_id";
/// Form-wide errors
pub const FIELD_BASE: &str = "base";

/// Sub-topics left behind by earlier discovery attempts
const IGNORED_SUFFIXES: [&str; 2] = ["/test_discovery", "/ping"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTimings {
    /// Wait for retained messages right after subscribing
    pub retained: Duration,
    /// Then wait for live traffic
    pub live: Duration,
    /// Finally look for a last-will status topic
    pub status: Duration,
}

impl Default for ProbeTimings {
    fn default() -> Self {
        Self {
            retained: Duration::from_secs(2),
            live: Duration::from_secs(3),
            status: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("MQTT broker is not connected")]
    NotConnected,

    #[error("Failed to subscribe: {0}")]
    Subscribe(#[from] ClientError),
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Invalid device id: {0}")]
    InvalidDeviceId(#[from] DeviceIdError),

    #[error("Device {0} is already configured")]
    AlreadyConfigured(String),

    #[error("Cannot reach the broker: {0}")]
    CannotConnect(#[from] ProbeError),

    #[error("No MQTT topics found for device {0}")]
    NotFound(String),
}

impl SetupError {
    /// The form field and error key to show the user
    pub fn form_error(&self) -> (&'static str, &'static str) {
        match self {
            SetupError::InvalidDeviceId(e) => (FIELD_DEVICE_ID, e.form_key()),
            SetupError::AlreadyConfigured(_) => (FIELD_DEVICE_ID, "device_id_already_configured"),
            SetupError::CannotConnect(_) => (FIELD_BASE, "cannot_connect"),
            SetupError::NotFound(_) => (FIELD_BASE, "mqtt_topic_not_found"),
        }
    }
}

/// Check a user-entered identifier against the format rules and the
/// devices already configured.
pub fn validate_user_input(raw: &str, existing: &[DeviceId]) -> Result<DeviceId, SetupError> {
    let device_id = DeviceId::parse(raw)?;
    if existing.iter().any(|d| d.same_device(&device_id)) {
        return Err(SetupError::AlreadyConfigured(device_id.to_string()));
    }
    Ok(device_id)
}

/// Validate, probe, and build the record to persist.
pub async fn add_device(
    bus: &Bus,
    raw: &str,
    name: Option<String>,
    existing: &[DeviceId],
    timings: &ProbeTimings,
) -> Result<DeviceEntry, SetupError> {
    let device_id = validate_user_input(raw, existing)?;

    if !probe_device(bus, &device_id, timings).await? {
        return Err(SetupError::NotFound(device_id.to_string()));
    }

    Ok(DeviceEntry {
        topics: Some(Topics::for_device(&device_id)),
        device_id: device_id.to_string(),
        version: DEVICE_RECORD_VERSION,
        name,
    })
}

/// Forwards the topic of every accepted message
struct Watch {
    tx: mpsc::UnboundedSender<String>,
    accept: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl Subscriber for Watch {
    fn deliver(&self, message: &MqttMessage) {
        debug!("Probe saw {}", message.topic);
        if (self.accept)(&message.topic) {
            let _ = self.tx.send(message.topic.clone());
        }
    }
}

async fn wait_for_hit(
    rx: &mut mpsc::UnboundedReceiver<String>,
    timeout: Duration,
) -> Option<String> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Look for any sign of the device on the broker.
///
/// Returns `Ok(false)` when nothing turned up. Subscriptions made here are
/// always released before returning.
pub async fn probe_device(
    bus: &Bus,
    device_id: &DeviceId,
    timings: &ProbeTimings,
) -> Result<bool, ProbeError> {
    if !bus.is_connected().await {
        error!("MQTT broker is not connected, cannot probe {}", device_id);
        return Err(ProbeError::NotConnected);
    }

    let mut subscriptions = Vec::new();
    let result = probe_stages(bus, device_id, timings, &mut subscriptions).await;

    for subscription in subscriptions {
        let filter = subscription.filter().to_string();
        if let Err(e) = bus.unsubscribe(subscription).await {
            warn!("Failed to release probe subscription {}: {}", filter, e);
        }
    }

    result
}

async fn probe_stages(
    bus: &Bus,
    device_id: &DeviceId,
    timings: &ProbeTimings,
    subscriptions: &mut Vec<Subscription>,
) -> Result<bool, ProbeError> {
    let prefix = format!("{}/", device_id);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watch = Arc::new(Watch {
        tx,
        accept: Box::new(move |topic: &str| {
            topic.starts_with(&prefix) && !IGNORED_SUFFIXES.iter().any(|s| topic.ends_with(s))
        }),
    });
    subscriptions.push(bus.subscribe(&format!("{}/#", device_id), QoS::AtMostOnce, watch).await?);

    if let Some(topic) = wait_for_hit(&mut rx, timings.retained).await {
        info!("Found existing topic {}", topic);
        return Ok(true);
    }
    debug!("No retained messages for {}", device_id);

    if let Some(topic) = wait_for_hit(&mut rx, timings.live).await {
        info!("Device {} is active ({})", device_id, topic);
        return Ok(true);
    }
    debug!("No live traffic from {}", device_id);

    let status_topic = format!("{}/status", device_id);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let expected = status_topic.clone();
    let watch = Arc::new(Watch {
        tx,
        accept: Box::new(move |topic: &str| topic == expected),
    });
    subscriptions.push(bus.subscribe(&status_topic, QoS::AtMostOnce, watch).await?);

    if wait_for_hit(&mut rx, timings.status).await.is_some() {
        info!("Found status topic {}", status_topic);
        return Ok(true);
    }

    debug!("Nothing found for {}", device_id);
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::mqtt::MockHandle;
    use crate::integrations::mqtt::MockMqttClient;

    const DEVICE: &str = "1cdbd4cbcc74";

    fn quick() -> ProbeTimings {
        ProbeTimings {
            retained: Duration::from_millis(20),
            live: Duration::from_millis(20),
            status: Duration::from_millis(20),
        }
    }

    fn connected_bus() -> (Arc<Bus>, MockHandle) {
        let client = MockMqttClient::new();
        let mqtt = client.handle();
        mqtt.set_connected(true);
        (Bus::new(client), mqtt)
    }

    /// Run the probe in the background and deliver `topic` once the given
    /// filter is routed
    async fn probe_with(bus: &Arc<Bus>, filter: &str, topic: &str) -> bool {
        let task = tokio::spawn({
            let bus = bus.clone();
            async move {
                let id = DeviceId::parse(DEVICE).unwrap();
                probe_device(&bus, &id, &quick()).await
            }
        });
        while bus.route_count(filter) == 0 {
            tokio::task::yield_now().await;
        }
        bus.dispatch(&MqttMessage::new(topic, "1"));
        task.await.unwrap().unwrap()
    }

    #[test]
    fn test_validate_user_input() {
        let existing = vec![DeviceId::parse("AABBCCDDEEFF").unwrap()];

        let id = validate_user_input("  1cdbd4cbcc74 ", &existing).unwrap();
        assert_eq!(id.as_str(), DEVICE);

        let form = |raw: &str| validate_user_input(raw, &existing).unwrap_err().form_error();
        assert_eq!(form(""), ("device_id", "device_id_required"));
        assert_eq!(form("abc"), ("device_id", "device_id_length"));
        assert_eq!(form("1cdbd4cbcc7z"), ("device_id", "device_id_format"));
        assert_eq!(form("aabbccddeeff"), ("device_id", "device_id_already_configured"));
    }

    #[tokio::test]
    async fn test_probe_finds_device_topic() {
        let (bus, mqtt) = connected_bus();
        assert!(probe_with(&bus, "1cdbd4cbcc74/#", "1cdbd4cbcc74/mode/out").await);

        assert!(mqtt.published().is_empty());
        assert_eq!(mqtt.unsubscriptions(), vec!["1cdbd4cbcc74/#".to_string()]);
        assert_eq!(bus.route_count("1cdbd4cbcc74/#"), 0);
    }

    #[tokio::test]
    async fn test_probe_ignores_self_test_topics() {
        let (bus, mqtt) = connected_bus();
        assert!(!probe_with(&bus, "1cdbd4cbcc74/#", "1cdbd4cbcc74/test_discovery").await);

        assert!(mqtt.published().is_empty());
        let mut released = mqtt.unsubscriptions();
        released.sort();
        assert_eq!(released, vec!["1cdbd4cbcc74/#", "1cdbd4cbcc74/status"]);
    }

    #[tokio::test]
    async fn test_probe_falls_back_to_status() {
        let (bus, _mqtt) = connected_bus();
        assert!(probe_with(&bus, "1cdbd4cbcc74/status", "1cdbd4cbcc74/status").await);
    }

    #[tokio::test]
    async fn test_probe_requires_connection() {
        let (bus, mqtt) = connected_bus();
        mqtt.set_connected(false);
        let id = DeviceId::parse(DEVICE).unwrap();

        let err = add_device(&bus, DEVICE, None, &[], &quick()).await.unwrap_err();
        assert_eq!(err.form_error(), ("base", "cannot_connect"));
        assert!(probe_device(&bus, &id, &quick()).await.is_err());
        assert!(mqtt.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_add_device_not_found() {
        let (bus, _mqtt) = connected_bus();
        let err = add_device(&bus, DEVICE, None, &[], &quick()).await.unwrap_err();
        assert_eq!(err.form_error(), ("base", "mqtt_topic_not_found"));
    }

    #[tokio::test]
    async fn test_add_device_builds_record() {
        let (bus, _mqtt) = connected_bus();
        let task = tokio::spawn({
            let bus = bus.clone();
            async move {
                add_device(&bus, "1CDBD4CBCC74", Some("Bedroom".into()), &[], &quick()).await
            }
        });
        while bus.route_count("1CDBD4CBCC74/#") == 0 {
            tokio::task::yield_now().await;
        }
        bus.dispatch(&MqttMessage::new("1CDBD4CBCC74/connected/out", "1"));

        let entry = task.await.unwrap().unwrap();
        assert_eq!(entry.device_id, "1CDBD4CBCC74");
        assert_eq!(entry.version, 2);
        assert_eq!(entry.name.as_deref(), Some("Bedroom"));
        assert_eq!(
            entry.topics.unwrap().fan_speed_in,
            "1CDBD4CBCC74/power/in"
        );
    }
}
