//! Climate entity: the full state machine for one air conditioner.
//!
//! Mode, fan speed and louvre state are kept as wire-code enums and mapped
//! to keys for display. Entering fan-only with the fan on auto forces the
//! fan to low. An inbound mode change only marks the correction as pending
//! and asks the runner for a deferred step; a mode command applies it before
//! publishing the mode. Either way the device ends up on low.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use strum::IntoEnumIterator;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::codec::parse_temperature;
use super::codec::FanSpeed;
use super::codec::HvacAction;
use super::codec::HvacMode;
use super::codec::SwingMode;
use super::codec::WireCode;
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
pub struct ClimateState {
    pub hvac_mode: HvacMode,
    pub hvac_modes: Vec<HvacMode>,
    pub hvac_action: HvacAction,
    pub current_temperature: Option<f64>,
    pub target_temperature: f64,
    pub min_temp: i64,
    pub max_temp: i64,
    pub target_temperature_step: i64,
    pub temperature_unit: &'static str,
    pub fan_mode: FanSpeed,
    pub fan_modes: Vec<FanSpeed>,
    pub previous_fan_mode: FanSpeed,
    pub swing_mode: SwingMode,
    pub swing_modes: Vec<SwingMode>,
    pub is_fan_only_mode: bool,
}

pub struct Climate {
    core: EntityCore,
    topics: Topics,
    hvac_mode: HvacMode,
    hvac_action: HvacAction,
    current_temperature: Option<f64>,
    target_temperature: f64,
    fan_mode: FanSpeed,
    /// Last fan speed other than auto
    previous_fan_mode: FanSpeed,
    swing_mode: SwingMode,
    /// Mode restored by turn_on
    last_active_mode: HvacMode,
    fan_correction_pending: bool,
}

impl Climate {
    pub fn new(info: EntityInfo, bus: Arc<Bus>, topics: &Topics) -> Self {
        Self {
            core: EntityCore::new(info, bus),
            topics: topics.clone(),
            hvac_mode: HvacMode::Off,
            hvac_action: HvacAction::Off,
            current_temperature: None,
            target_temperature: TEMP_MIN as f64,
            fan_mode: FanSpeed::Auto,
            previous_fan_mode: FanSpeed::Auto,
            swing_mode: SwingMode::Off,
            last_active_mode: HvacMode::Auto,
            fan_correction_pending: false,
        }
    }

    /// Fan speeds that may be selected right now
    pub fn fan_modes(&self) -> Vec<FanSpeed> {
        if !self.core.available() {
            return Vec::new();
        }
        FanSpeed::iter()
            .filter(|f| self.hvac_mode != HvacMode::FanOnly || *f != FanSpeed::Auto)
            .collect()
    }

    fn apply_mode(&mut self, mode: HvacMode) {
        self.hvac_mode = mode;
        self.hvac_action = HvacAction::from(mode);
        if mode != HvacMode::Off {
            self.last_active_mode = mode;
        }
    }

    fn on_mode(&mut self, payload: &str) -> Followup {
        let Some(mode) = HvacMode::from_code(payload) else {
            warn!("{}: unknown mode {:?}", self.core.unique_id(), payload);
            return Followup::None;
        };

        if mode == HvacMode::FanOnly
            && self.hvac_mode != HvacMode::FanOnly
            && self.fan_mode == FanSpeed::Auto
        {
            debug!("{}: fan-only with auto fan, correcting", self.core.unique_id());
            self.fan_correction_pending = true;
        }
        self.apply_mode(mode);

        if self.fan_correction_pending {
            Followup::Deferred
        } else {
            Followup::None
        }
    }

    fn on_current_temperature(&mut self, payload: &str) {
        match parse_temperature(payload) {
            Some(t) => self.current_temperature = Some(t),
            None => warn!("{}: invalid temperature {:?}", self.core.unique_id(), payload),
        }
    }

    fn on_target_temperature(&mut self, payload: &str) {
        match parse_temperature(payload) {
            Some(t) => self.target_temperature = t,
            None => warn!(
                "{}: invalid target temperature {:?}",
                self.core.unique_id(),
                payload
            ),
        }
    }

    fn on_fan_speed(&mut self, payload: &str) {
        let Some(fan) = FanSpeed::from_code(payload) else {
            warn!("{}: unknown fan speed {:?}", self.core.unique_id(), payload);
            return;
        };

        if self.fan_mode != FanSpeed::Auto {
            self.previous_fan_mode = self.fan_mode;
        }
        if fan != FanSpeed::Auto {
            self.fan_correction_pending = false;
        }
        self.fan_mode = fan;
    }

    fn on_swing(&mut self, payload: &str) {
        match SwingMode::from_code(payload) {
            Some(swing) => self.swing_mode = swing,
            None => warn!("{}: unknown blinds state {:?}", self.core.unique_id(), payload),
        }
    }

    async fn set_hvac_mode(&mut self, mode: HvacMode) -> Result<(), CommandError> {
        if mode == HvacMode::FanOnly
            && self.hvac_mode != HvacMode::FanOnly
            && self.fan_mode == FanSpeed::Auto
        {
            self.set_fan_mode(FanSpeed::Low).await?;
        }

        self.core
            .publish(&self.topics.mode_in, mode.code(), QoS::AtMostOnce)
            .await?;
        self.apply_mode(mode);
        info!(
            "{}: mode set to {} (wire {})",
            self.core.unique_id(),
            mode.key(),
            mode.code()
        );
        Ok(())
    }

    async fn set_temperature(&mut self, requested: f64) -> Result<(), CommandError> {
        if !requested.is_finite() {
            error!("{}: invalid temperature {}", self.core.unique_id(), requested);
            return Ok(());
        }

        let value = requested.clamp(TEMP_MIN as f64, TEMP_MAX as f64)
            .round_ties_even() as i64;
        self.core
            .publish(&self.topics.temp_comfort_in, &value.to_string(), QoS::AtMostOnce)
            .await?;
        self.target_temperature = value as f64;
        info!("{}: target temperature set to {}°C", self.core.unique_id(), value);
        Ok(())
    }

    async fn set_fan_mode(&mut self, fan: FanSpeed) -> Result<(), CommandError> {
        if self.hvac_mode == HvacMode::FanOnly && fan == FanSpeed::Auto {
            warn!(
                "{}: auto fan speed is not available in fan-only mode",
                self.core.unique_id()
            );
            return Ok(());
        }

        self.core
            .publish(&self.topics.fan_speed_in, fan.code(), QoS::AtMostOnce)
            .await?;
        if fan != FanSpeed::Auto {
            self.previous_fan_mode = fan;
            self.fan_correction_pending = false;
        }
        self.fan_mode = fan;
        info!(
            "{}: fan speed set to {} (wire {})",
            self.core.unique_id(),
            fan.key(),
            fan.code()
        );
        Ok(())
    }

    async fn set_swing_mode(&mut self, swing: SwingMode) -> Result<(), CommandError> {
        self.core
            .publish(&self.topics.backlight_in, swing.code(), QoS::AtMostOnce)
            .await?;
        self.swing_mode = swing;
        info!("{}: blinds set to {}", self.core.unique_id(), swing.key());
        Ok(())
    }
}

#[async_trait]
impl Entity for Climate {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn inbound_topics(&self) -> Vec<(String, QoS)> {
        [
            &self.topics.mode_out,
            &self.topics.temp_out,
            &self.topics.temp_comfort_out,
            &self.topics.fan_speed_out,
            &self.topics.backlight_out,
        ]
        .into_iter()
        .map(|topic| (topic.clone(), QoS::AtMostOnce))
        .collect()
    }

    fn handle_message(&mut self, message: &MqttMessage) -> Followup {
        let payload = message.payload_str();
        let topic = message.topic.as_str();

        if topic == self.topics.mode_out {
            return self.on_mode(&payload);
        }

        if topic == self.topics.temp_out {
            self.on_current_temperature(&payload);
        } else if topic == self.topics.temp_comfort_out {
            self.on_target_temperature(&payload);
        } else if topic == self.topics.fan_speed_out {
            self.on_fan_speed(&payload);
        } else if topic == self.topics.backlight_out {
            self.on_swing(&payload);
        } else {
            debug!("{}: ignoring message on {}", self.core.unique_id(), topic);
        }
        Followup::None
    }

    fn reset_state(&mut self) {
        self.current_temperature = None;
        // Forced off while the device is unknown; the next mode message recomputes it
        self.hvac_action = HvacAction::Off;
        self.fan_correction_pending = false;
    }

    fn state(&self) -> EntityState {
        EntityState::Climate(ClimateState {
            hvac_mode: self.hvac_mode,
            hvac_modes: HvacMode::iter().collect(),
            hvac_action: self.hvac_action,
            current_temperature: self.current_temperature,
            target_temperature: self.target_temperature,
            min_temp: TEMP_MIN,
            max_temp: TEMP_MAX,
            target_temperature_step: TEMP_STEP,
            temperature_unit: "°C",
            fan_mode: self.fan_mode,
            fan_modes: self.fan_modes(),
            previous_fan_mode: self.previous_fan_mode,
            swing_mode: self.swing_mode,
            swing_modes: vec![SwingMode::On, SwingMode::Off],
            is_fan_only_mode: self.hvac_mode == HvacMode::FanOnly,
        })
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), CommandError> {
        match command {
            Command::SetHvacMode { hvac_mode } => match HvacMode::from_key(&hvac_mode) {
                Some(mode) => self.set_hvac_mode(mode).await,
                None => {
                    error!("{}: unsupported mode {:?}", self.core.unique_id(), hvac_mode);
                    Ok(())
                }
            },
            Command::SetTemperature { temperature } => self.set_temperature(temperature).await,
            Command::SetFanMode { fan_mode } => {
                match FanSpeed::from_key(&fan_mode) {
                    Some(fan) if self.fan_modes().contains(&fan) => self.set_fan_mode(fan).await,
                    Some(FanSpeed::Auto) => {
                        warn!(
                            "{}: auto fan speed is not available in fan-only mode",
                            self.core.unique_id()
                        );
                        Ok(())
                    }
                    _ => {
                        error!("{}: unsupported fan speed {:?}", self.core.unique_id(), fan_mode);
                        Ok(())
                    }
                }
            }
            Command::SetSwingMode { swing_mode } => match SwingMode::from_key(&swing_mode) {
                Some(swing) => self.set_swing_mode(swing).await,
                None => {
                    error!(
                        "{}: unsupported blinds mode {:?}",
                        self.core.unique_id(),
                        swing_mode
                    );
                    Ok(())
                }
            },
            Command::TurnOn => self.set_hvac_mode(self.last_active_mode).await,
            Command::TurnOff => self.set_hvac_mode(HvacMode::Off).await,
            other => Err(self.core.unsupported(&other)),
        }
    }

    async fn run_deferred(&mut self) -> Result<(), CommandError> {
        if !self.fan_correction_pending || !self.core.available() {
            return Ok(());
        }
        self.fan_correction_pending = false;

        if self.hvac_mode == HvacMode::FanOnly && self.fan_mode == FanSpeed::Auto {
            self.set_fan_mode(FanSpeed::Low).await?;
        }
        Ok(())
    }
}
