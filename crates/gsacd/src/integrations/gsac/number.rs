use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::codec::parse_temperature;
use super::codec::TEMP_DEFAULT;
use super::codec::TEMP_MAX;
use super::codec::TEMP_MIN;
use super::codec::TEMP_STEP;
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
pub struct NumberState {
    pub value: i64,
    pub min: i64,
    pub max: i64,
    pub step: i64,
    pub unit: &'static str,
    pub icon: &'static str,
}

/// Round to whole degrees, rejecting anything outside the unit's range
fn whole_degrees(t: f64) -> Option<i64> {
    if !t.is_finite() {
        return None;
    }
    let t = t.round_ties_even();
    if t < TEMP_MIN as f64 || t > TEMP_MAX as f64 {
        return None;
    }
    Some(t as i64)
}

/// Box input for the target temperature.
///
/// Stricter than the climate entity: out-of-range values are refused rather
/// than clamped.
pub struct TargetTemperatureNumber {
    core: EntityCore,
    state_topic: String,
    command_topic: String,
    value: i64,
}

impl TargetTemperatureNumber {
    pub fn new(info: EntityInfo, bus: Arc<Bus>, topics: &Topics) -> Self {
        Self {
            core: EntityCore::new(info, bus),
            state_topic: topics.temp_comfort_out.clone(),
            command_topic: topics.temp_comfort_in.clone(),
            value: TEMP_DEFAULT,
        }
    }

    async fn set_value(&mut self, requested: f64) -> Result<(), CommandError> {
        let Some(value) = whole_degrees(requested) else {
            error!(
                "{}: {} is outside {}..={}",
                self.core.unique_id(),
                requested,
                TEMP_MIN,
                TEMP_MAX
            );
            return Ok(());
        };

        self.core
            .publish(&self.command_topic, &value.to_string(), QoS::AtLeastOnce)
            .await?;
        self.value = value;
        info!("{}: target temperature set to {}°C", self.core.unique_id(), value);
        Ok(())
    }
}

#[async_trait]
impl Entity for TargetTemperatureNumber {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn inbound_topics(&self) -> Vec<(String, QoS)> {
        vec![(self.state_topic.clone(), QoS::AtLeastOnce)]
    }

    fn handle_message(&mut self, message: &MqttMessage) -> Followup {
        let payload = message.payload_str();
        match parse_temperature(&payload) {
            Some(t) => match whole_degrees(t) {
                Some(value) => self.value = value,
                None => warn!(
                    "{}: reported temperature {} out of range",
                    self.core.unique_id(),
                    t
                ),
            },
            None => warn!(
                "{}: invalid temperature {:?}",
                self.core.unique_id(),
                payload
            ),
        }
        Followup::None
    }

    fn reset_state(&mut self) {
        self.value = TEMP_DEFAULT;
    }

    fn state(&self) -> EntityState {
        EntityState::Number(NumberState {
            value: self.value,
            min: TEMP_MIN,
            max: TEMP_MAX,
            step: TEMP_STEP,
            unit: "°C",
            icon: "mdi:thermometer-plus",
        })
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), CommandError> {
        match command {
            Command::SetValue { value } => self.set_value(value).await,
            other => Err(self.core.unsupported(&other)),
        }
    }
}
