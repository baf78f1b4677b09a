use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::codec::FanSpeed;
use super::codec::HvacMode;
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
pub struct SelectState {
    pub current_option: &'static str,
    pub options: Vec<&'static str>,
    pub icon: &'static str,
    pub wire_code: &'static str,
}

/// Drop-down over one wire-code table. Options are the table's labels.
pub struct Select<T: WireCode> {
    core: EntityCore,
    state_topic: String,
    command_topic: String,
    current: T,
    icon: &'static str,
    default_icon: &'static str,
}

pub type ModeSelect = Select<HvacMode>;
pub type FanSpeedSelect = Select<FanSpeed>;

impl ModeSelect {
    pub fn mode(info: EntityInfo, bus: Arc<Bus>, topics: &Topics) -> Self {
        Self::new(
            info,
            bus,
            &topics.mode_out,
            &topics.mode_in,
            "mdi:air-conditioner",
        )
    }
}

impl FanSpeedSelect {
    pub fn fan_speed(info: EntityInfo, bus: Arc<Bus>, topics: &Topics) -> Self {
        Self::new(info, bus, &topics.fan_speed_out, &topics.fan_speed_in, "mdi:fan")
    }
}

impl<T: WireCode + Default + Send + Sync> Select<T> {
    fn new(
        info: EntityInfo,
        bus: Arc<Bus>,
        state_topic: &str,
        command_topic: &str,
        icon: &'static str,
    ) -> Self {
        Self {
            core: EntityCore::new(info, bus),
            state_topic: state_topic.to_string(),
            command_topic: command_topic.to_string(),
            current: T::default(),
            icon,
            default_icon: icon,
        }
    }

    async fn select_option(&mut self, option: &str) -> Result<(), CommandError> {
        let Some(value) = T::from_label(option) else {
            error!("{}: invalid option {:?}", self.core.unique_id(), option);
            return Ok(());
        };

        self.core
            .publish(&self.command_topic, value.code(), QoS::AtLeastOnce)
            .await?;
        self.current = value;
        self.icon = value.icon();
        info!(
            "{}: selected {} (wire {})",
            self.core.unique_id(),
            option,
            value.code()
        );
        Ok(())
    }
}

#[async_trait]
impl<T: WireCode + Default + Send + Sync> Entity for Select<T> {
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
        debug!("{}: received {:?}", self.core.unique_id(), payload);
        match T::from_code(&payload) {
            Some(value) => {
                self.current = value;
                self.icon = value.icon();
            }
            None => warn!("{}: unknown value {:?}", self.core.unique_id(), payload),
        }
        Followup::None
    }

    fn reset_state(&mut self) {
        self.current = T::default();
        self.icon = self.default_icon;
    }

    fn state(&self) -> EntityState {
        EntityState::Select(SelectState {
            current_option: self.current.label(),
            options: T::labels(),
            icon: self.icon,
            wire_code: self.current.code(),
        })
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), CommandError> {
        match command {
            Command::SelectOption { option } => self.select_option(&option).await,
            other => Err(self.core.unsupported(&other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EntityHandle;
    use crate::engine::EntityKind;
    use crate::integrations::gsac::entity::testing::Harness;
    use crate::integrations::gsac::entity::EntityMailbox;

    fn select_state(state: EntityState) -> SelectState {
        match state {
            EntityState::Select(s) => s,
            other => panic!("not a select: {:?}", other),
        }
    }

    async fn online<E: Entity>(h: &Harness, entity: E) -> Arc<EntityMailbox> {
        let mailbox = h.start(Box::new(entity)).await;
        h.set_available(&mailbox, true).await;
        mailbox
    }

    fn select_option(option: &str) -> Command {
        Command::SelectOption {
            option: option.to_string(),
        }
    }

    #[tokio::test]
    async fn test_mode_select_inbound() {
        let h = Harness::new();
        let info = h.info("gsac_test_mode_select", EntityKind::Select);
        let mailbox = online(&h, ModeSelect::mode(info, h.bus.clone(), &h.topics)).await;
        assert_eq!(
            h.mqtt.subscription_qos(&h.topics.mode_out),
            Some(QoS::AtLeastOnce)
        );

        let state = select_state(mailbox.snapshot().await.unwrap());
        assert_eq!(state.current_option, "Off");
        assert_eq!(state.icon, "mdi:air-conditioner");
        assert_eq!(
            state.options,
            vec!["Off", "Auto", "Cool", "Dry", "Heat", "Fan only"]
        );

        h.inject(&h.topics.mode_out, "4");
        let state = select_state(mailbox.snapshot().await.unwrap());
        assert_eq!(state.current_option, "Heat");
        assert_eq!(state.icon, "mdi:fire");
        assert_eq!(state.wire_code, "4");

        // Unknown code keeps the last good value
        h.inject(&h.topics.mode_out, "9");
        assert_eq!(
            select_state(mailbox.snapshot().await.unwrap()).current_option,
            "Heat"
        );
    }

    #[tokio::test]
    async fn test_fan_select_command() {
        let h = Harness::new();
        let info = h.info("gsac_test_fan_speed_select", EntityKind::Select);
        let mailbox = online(&h, FanSpeedSelect::fan_speed(info, h.bus.clone(), &h.topics)).await;

        mailbox.command(select_option("Medium")).await.unwrap();
        assert_eq!(
            h.mqtt.published_with_qos(),
            vec![(h.topics.fan_speed_in.clone(), QoS::AtLeastOnce)]
        );
        assert_eq!(h.mqtt.published()[0].1, "2");

        let state = select_state(mailbox.snapshot().await.unwrap());
        assert_eq!(state.current_option, "Medium");
        assert_eq!(state.icon, "mdi:fan-speed-2");
    }

    #[tokio::test]
    async fn test_unknown_label_rejected() {
        let h = Harness::new();
        let info = h.info("gsac_test_fan_speed_select", EntityKind::Select);
        let mailbox = online(&h, FanSpeedSelect::fan_speed(info, h.bus.clone(), &h.topics)).await;

        // Keys are not labels
        mailbox.command(select_option("medium")).await.unwrap();
        assert!(h.mqtt.published().is_empty());
        assert_eq!(
            select_state(mailbox.snapshot().await.unwrap()).current_option,
            "Auto"
        );
    }

    #[tokio::test]
    async fn test_reset_to_code_zero() {
        let h = Harness::new();
        let info = h.info("gsac_test_mode_select", EntityKind::Select);
        let mailbox = online(&h, ModeSelect::mode(info, h.bus.clone(), &h.topics)).await;

        h.inject(&h.topics.mode_out, "2");
        h.set_available(&mailbox, false).await;

        let state = select_state(mailbox.snapshot().await.unwrap());
        assert_eq!(state.current_option, "Off");
        assert_eq!(state.wire_code, "0");
        assert_eq!(state.icon, "mdi:air-conditioner");
    }
}
