//! GoldStar GSAC/GSACI air conditioners over MQTT.
//!
//! One [`GsacDevice`] per configured unit. It owns the unit's availability
//! manager and the seven entity tasks, and registers each entity with the
//! engine.

mod availability;
mod climate;
mod codec;
mod device_id;
mod entity;
mod number;
mod select;
mod sensor;
pub mod setup;
mod switch;
mod topics;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;

pub use availability::AvailabilityManager;
pub use codec::FanSpeed;
pub use codec::HvacMode;
pub use codec::SwingMode;
pub use device_id::DeviceId;
pub use device_id::DeviceIdError;
pub use entity::EntityMailbox;
pub use topics::TopicKey;
pub use topics::Topics;

use self::climate::Climate;
use self::entity::Entity;
use self::number::TargetTemperatureNumber;
use self::select::FanSpeedSelect;
use self::select::ModeSelect;
use self::sensor::TemperatureSensor;
use self::switch::BlindsSwitch;
use crate::engine::EntityInfo;
use crate::engine::EntityKind;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::integrations::mqtt::Bus;
use crate::integrations::mqtt::ClientError;

struct RunningEntity {
    mailbox: Arc<EntityMailbox>,
    task: JoinHandle<()>,
}

/// A configured air conditioner and its entities
pub struct GsacDevice {
    device_id: DeviceId,
    bus: Arc<Bus>,
    availability: Arc<AvailabilityManager>,
    entities: Vec<RunningEntity>,
    to_engine: FromIntegrationSender,
}

fn entity_info(
    device_id: &DeviceId,
    name: &str,
    suffix: &str,
    kind: EntityKind,
    label: &str,
) -> EntityInfo {
    EntityInfo {
        unique_id: format!("gsac_{}_{}", device_id, suffix),
        kind,
        device_id: device_id.to_string(),
        name: if label.is_empty() {
            name.to_string()
        } else {
            format!("{} {}", name, label)
        },
    }
}

fn build_entities(
    device_id: &DeviceId,
    name: &str,
    bus: &Arc<Bus>,
    topics: &Topics,
) -> Vec<Box<dyn Entity>> {
    let info = |suffix, kind, label| entity_info(device_id, name, suffix, kind, label);

    vec![
        Box::new(Climate::new(
            info("climate", EntityKind::Climate, ""),
            bus.clone(),
            topics,
        )),
        Box::new(ModeSelect::mode(
            info("mode_select", EntityKind::Select, "Mode"),
            bus.clone(),
            topics,
        )),
        Box::new(FanSpeedSelect::fan_speed(
            info("fan_speed_select", EntityKind::Select, "Fan speed"),
            bus.clone(),
            topics,
        )),
        Box::new(TemperatureSensor::current(
            info("current_temperature", EntityKind::Sensor, "Temperature"),
            bus.clone(),
            topics,
        )),
        Box::new(TemperatureSensor::target(
            info("target_temperature", EntityKind::Sensor, "Target temperature"),
            bus.clone(),
            topics,
        )),
        Box::new(TargetTemperatureNumber::new(
            info("target_temperature_set", EntityKind::Number, "Set temperature"),
            bus.clone(),
            topics,
        )),
        Box::new(BlindsSwitch::new(
            info("horizontal_blinds", EntityKind::Switch, "Horizontal blinds"),
            bus.clone(),
            topics,
        )),
    ]
}

impl GsacDevice {
    /// Create every entity, register them with the engine, then start
    /// watching the connectivity topic.
    pub async fn setup(
        device_id: DeviceId,
        name: &str,
        bus: Arc<Bus>,
        to_engine: FromIntegrationSender,
    ) -> Result<Self, ClientError> {
        let topics = Topics::for_device(&device_id);
        let availability =
            AvailabilityManager::new(device_id.clone(), topics.connected_out.clone());

        let mut device = Self {
            device_id: device_id.clone(),
            bus: bus.clone(),
            availability: availability.clone(),
            entities: Vec::new(),
            to_engine: to_engine.clone(),
        };

        for built in build_entities(&device_id, name, &bus, &topics) {
            let info = built.core().info.clone();
            let (mailbox, task) = entity::spawn(built, availability.clone(), to_engine.clone());

            let added = FromIntegrationMessage::EntityAdded {
                info,
                handle: mailbox.clone(),
            };
            if let Err(e) = to_engine.send(added).await {
                warn!("Failed to send EntityAdded message: {}", e);
            }
            device.entities.push(RunningEntity { mailbox, task });
        }

        if let Err(e) = availability.subscribe(&bus).await {
            device.unload().await;
            return Err(e);
        }

        info!(
            "Device {} ({}) set up with {} entities",
            device_id,
            name,
            device.entities.len()
        );
        Ok(device)
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn available(&self) -> bool {
        self.availability.available()
    }

    pub fn entity_ids(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.mailbox.unique_id()).collect()
    }

    /// Tear every entity down and stop watching the device
    pub async fn unload(self) {
        for entity in self.entities {
            let unique_id = entity.mailbox.unique_id().to_string();
            entity.mailbox.remove().await;
            if let Err(e) = entity.task.await {
                warn!("{}: entity task failed: {}", unique_id, e);
            }

            let removed = FromIntegrationMessage::EntityRemoved { unique_id };
            if let Err(e) = self.to_engine.send(removed).await {
                warn!("Failed to send EntityRemoved message: {}", e);
            }
        }

        if let Err(e) = self.availability.unsubscribe(&self.bus).await {
            warn!("Device {}: failed to release connectivity topic: {}", self.device_id, e);
        }
        info!("Device {} unloaded", self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::Command;
    use crate::engine::Engine;
    use crate::engine::State;
    use crate::integrations::mqtt::MockHandle;
    use crate::integrations::mqtt::MockMqttClient;
    use crate::integrations::mqtt::MqttMessage;

    const DEVICE: &str = "1cdbd4cbcc74";

    struct Fixture {
        engine: Arc<Engine>,
        bus: Arc<Bus>,
        mqtt: MockHandle,
        topics: Topics,
    }

    fn fixture() -> Fixture {
        let client = MockMqttClient::new();
        let mqtt = client.handle();
        let engine = Arc::new(Engine::new());
        tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });
        Fixture {
            engine,
            bus: Bus::new(client),
            mqtt,
            topics: Topics::for_device(&DeviceId::parse(DEVICE).unwrap()),
        }
    }

    async fn setup(f: &Fixture) -> GsacDevice {
        GsacDevice::setup(
            DeviceId::parse(DEVICE).unwrap(),
            "Bedroom AC",
            f.bus.clone(),
            f.engine.sender(),
        )
        .await
        .unwrap()
    }

    /// Poll the engine snapshot until `check` holds
    async fn wait_for(engine: &Engine, check: impl Fn(&State) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check(&engine.state_snapshot()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn all_available(state: &State, available: bool) -> bool {
        state.entities.len() == 7
            && state
                .entities
                .values()
                .all(|r| r.available == available && !r.state.is_null())
    }

    #[tokio::test]
    async fn test_setup_registers_entities() {
        let f = fixture();
        let device = setup(&f).await;

        let mut ids = device.entity_ids();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                "gsac_1cdbd4cbcc74_climate",
                "gsac_1cdbd4cbcc74_current_temperature",
                "gsac_1cdbd4cbcc74_fan_speed_select",
                "gsac_1cdbd4cbcc74_horizontal_blinds",
                "gsac_1cdbd4cbcc74_mode_select",
                "gsac_1cdbd4cbcc74_target_temperature",
                "gsac_1cdbd4cbcc74_target_temperature_set",
            ]
        );

        wait_for(&f.engine, |s| all_available(s, false)).await;
        let state = f.engine.state_snapshot();
        let climate = state.get("gsac_1cdbd4cbcc74_climate").unwrap();
        assert_eq!(climate.info.name, "Bedroom AC");
        assert_eq!(climate.state["hvac_mode"], "off");

        // Only the connectivity topic until the device shows up
        assert_eq!(f.mqtt.subscriptions(), vec![f.topics.connected_out.clone()]);
        assert!(!device.available());
    }

    #[tokio::test]
    async fn test_online_then_command() {
        let f = fixture();
        let device = setup(&f).await;

        f.bus.dispatch(&MqttMessage::new(f.topics.connected_out.as_str(), "1"));
        wait_for(&f.engine, |s| all_available(s, true)).await;
        assert!(device.available());
        assert_eq!(f.bus.route_count(&f.topics.mode_out), 2);

        f.bus.dispatch(&MqttMessage::new(f.topics.temp_out.as_str(), "23.5"));
        wait_for(&f.engine, |s| {
            s.get("gsac_1cdbd4cbcc74_current_temperature")
                .is_some_and(|r| r.state["value"] == 23.5)
        })
        .await;

        f.engine
            .send_command(
                "gsac_1cdbd4cbcc74_climate",
                Command::SetTemperature { temperature: 35.0 },
            )
            .await
            .unwrap();
        assert_eq!(
            f.mqtt.published(),
            vec![(f.topics.temp_comfort_in.clone(), "30".to_string())]
        );
    }

    #[tokio::test]
    async fn test_offline_resets_every_entity() {
        let f = fixture();
        let _device = setup(&f).await;

        f.bus.dispatch(&MqttMessage::new(f.topics.connected_out.as_str(), "1"));
        wait_for(&f.engine, |s| all_available(s, true)).await;
        f.bus.dispatch(&MqttMessage::new(f.topics.temp_out.as_str(), "21"));

        f.bus.dispatch(&MqttMessage::new(f.topics.connected_out.as_str(), "0"));
        wait_for(&f.engine, |s| all_available(s, false)).await;

        let state = f.engine.state_snapshot();
        let sensor = state.get("gsac_1cdbd4cbcc74_current_temperature").unwrap();
        assert!(sensor.state["value"].is_null());
        assert_eq!(f.bus.route_count(&f.topics.temp_out), 0);
        assert_eq!(f.bus.route_count(&f.topics.connected_out), 1);
    }

    #[tokio::test]
    async fn test_unload_removes_everything() {
        let f = fixture();
        let device = setup(&f).await;
        f.bus.dispatch(&MqttMessage::new(f.topics.connected_out.as_str(), "1"));
        wait_for(&f.engine, |s| all_available(s, true)).await;

        device.unload().await;
        wait_for(&f.engine, |s| s.entities.is_empty()).await;

        assert_eq!(f.bus.route_count(&f.topics.connected_out), 0);
        assert_eq!(f.bus.route_count(&f.topics.mode_out), 0);
        assert!(f.mqtt.unsubscriptions().contains(&f.topics.connected_out));
        assert!(f.mqtt.published().is_empty());
    }
}
