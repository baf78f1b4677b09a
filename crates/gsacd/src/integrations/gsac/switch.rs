use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use super::codec::SwingMode;
use super::codec::WireCode;
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
pub struct SwitchState {
    pub is_on: bool,
    pub icon: &'static str,
}

/// Horizontal louvre switch
pub struct BlindsSwitch {
    core: EntityCore,
    state_topic: String,
    command_topic: String,
    is_on: bool,
}

impl BlindsSwitch {
    pub fn new(info: EntityInfo, bus: Arc<Bus>, topics: &Topics) -> Self {
        Self {
            core: EntityCore::new(info, bus),
            state_topic: topics.backlight_out.clone(),
            command_topic: topics.backlight_in.clone(),
            is_on: false,
        }
    }

    async fn set(&mut self, on: bool) -> Result<(), CommandError> {
        let payload = SwingMode::from(on).code();
        self.core
            .publish(&self.command_topic, payload, QoS::AtMostOnce)
            .await?;
        self.is_on = on;
        info!(
            "{}: blinds turned {}",
            self.core.unique_id(),
            if on { "on" } else { "off" }
        );
        Ok(())
    }
}

#[async_trait]
impl Entity for BlindsSwitch {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn inbound_topics(&self) -> Vec<(String, QoS)> {
        vec![(self.state_topic.clone(), QoS::AtMostOnce)]
    }

    fn handle_message(&mut self, message: &MqttMessage) -> Followup {
        let payload = message.payload_str();
        match SwingMode::from_code(&payload) {
            Some(mode) => self.is_on = mode == SwingMode::On,
            None => warn!(
                "{}: unknown blinds state {:?}",
                self.core.unique_id(),
                payload
            ),
        }
        Followup::None
    }

    fn reset_state(&mut self) {
        self.is_on = false;
    }

    fn state(&self) -> EntityState {
        EntityState::Switch(SwitchState {
            is_on: self.is_on,
            icon: SwingMode::from(self.is_on).icon(),
        })
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), CommandError> {
        match command {
            Command::TurnOn => self.set(true).await,
            Command::TurnOff => self.set(false).await,
            other => Err(self.core.unsupported(&other)),
        }
    }
}
