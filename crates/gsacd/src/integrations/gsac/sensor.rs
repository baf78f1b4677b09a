use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use super::codec::parse_temperature;
use super::entity::Entity;
use super::entity::EntityCore;
use super::entity::EntityState;
use super::entity::Followup;
use super::topics::Topics;
use crate::engine::Command;
use crate::engine::CommandError;
use crate::engine::EntityInfo;
use crate::integrations::mqtt::Bus;
use crate::integrations::mqtt::MqttMessage;
use crate::integrations::mqtt::QoS;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    pub value: Option<f64>,
    pub unit: &'static str,
    pub device_class: &'static str,
    pub icon: &'static str,
}

/// Read-only temperature reading
pub struct TemperatureSensor {
    core: EntityCore,
    topic: String,
    icon: &'static str,
    /// Report whole degrees only
    round: bool,
    value: Option<f64>,
}

impl TemperatureSensor {
    /// Room temperature measured by the unit
    pub fn current(info: EntityInfo, bus: Arc<Bus>, topics: &Topics) -> Self {
        Self::new(info, bus, &topics.temp_out, "mdi:thermometer", false)
    }

    /// Target temperature as the unit reports it
    pub fn target(info: EntityInfo, bus: Arc<Bus>, topics: &Topics) -> Self {
        Self::new(info, bus, &topics.temp_comfort_out, "mdi:thermometer-check", true)
    }

    fn new(info: EntityInfo, bus: Arc<Bus>, topic: &str, icon: &'static str, round: bool) -> Self {
        Self {
            core: EntityCore::new(info, bus),
            topic: topic.to_string(),
            icon,
            round,
            value: None,
        }
    }
}

#[async_trait]
impl Entity for TemperatureSensor {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn inbound_topics(&self) -> Vec<(String, QoS)> {
        vec![(self.topic.clone(), QoS::AtLeastOnce)]
    }

    fn handle_message(&mut self, message: &MqttMessage) -> Followup {
        let payload = message.payload_str();
        debug!("{}: received {:?}", self.core.unique_id(), payload);

        // Unlike the selectors, a bad reading is shown as unknown
        self.value = match parse_temperature(&payload) {
            Some(t) if self.round => Some(t.round_ties_even()),
            Some(t) => Some(t),
            None => {
                warn!(
                    "{}: invalid temperature {:?}",
                    self.core.unique_id(),
                    payload
                );
                None
            }
        };
        Followup::None
    }

    fn reset_state(&mut self) {
        self.value = None;
    }

    fn state(&self) -> EntityState {
        EntityState::Sensor(SensorState {
            value: self.value,
            unit: "°C",
            device_class: "temperature",
            icon: self.icon,
        })
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), CommandError> {
        Err(self.core.unsupported(&command))
    }
}
