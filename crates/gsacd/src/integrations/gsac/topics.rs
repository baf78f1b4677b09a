use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;
use strum::IntoStaticStr;

use super::device_id::DeviceId;

/// The ten per-device topics, named the way they are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum TopicKey {
    ModeIn,
    ModeOut,
    TempOut,
    TempComfortOut,
    TempComfortIn,
    FanSpeedOut,
    FanSpeedIn,
    BacklightOut,
    BacklightIn,
    ConnectedOut,
}

impl TopicKey {
    /// Topic path below the device id
    pub fn suffix(self) -> &'static str {
        match self {
            TopicKey::ModeIn => "mode/in",
            TopicKey::ModeOut => "mode/out",
            TopicKey::TempOut => "sensor/temperature/out",
            TopicKey::TempComfortOut => "temperature_comfort/out",
            TopicKey::TempComfortIn => "temperature_comfort/in",
            TopicKey::FanSpeedOut => "power/out",
            TopicKey::FanSpeedIn => "power/in",
            TopicKey::BacklightOut => "backlight_auto/out",
            TopicKey::BacklightIn => "backlight_auto/in",
            TopicKey::ConnectedOut => "connected/out",
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Concrete topic strings for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topics {
    pub mode_in: String,
    pub mode_out: String,
    pub temp_out: String,
    pub temp_comfort_out: String,
    pub temp_comfort_in: String,
    pub fan_speed_out: String,
    pub fan_speed_in: String,
    pub backlight_out: String,
    pub backlight_in: String,
    pub connected_out: String,
}

impl Topics {
    pub fn for_device(id: &DeviceId) -> Self {
        let t = |key: TopicKey| format!("{}/{}", id, key.suffix());
        Self {
            mode_in: t(TopicKey::ModeIn),
            mode_out: t(TopicKey::ModeOut),
            temp_out: t(TopicKey::TempOut),
            temp_comfort_out: t(TopicKey::TempComfortOut),
            temp_comfort_in: t(TopicKey::TempComfortIn),
            fan_speed_out: t(TopicKey::FanSpeedOut),
            fan_speed_in: t(TopicKey::FanSpeedIn),
            backlight_out: t(TopicKey::BacklightOut),
            backlight_in: t(TopicKey::BacklightIn),
            connected_out: t(TopicKey::ConnectedOut),
        }
    }

    pub fn get(&self, key: TopicKey) -> &str {
        match key {
            TopicKey::ModeIn => &self.mode_in,
            TopicKey::ModeOut => &self.mode_out,
            TopicKey::TempOut => &self.temp_out,
            TopicKey::TempComfortOut => &self.temp_comfort_out,
            TopicKey::TempComfortIn => &self.temp_comfort_in,
            TopicKey::FanSpeedOut => &self.fan_speed_out,
            TopicKey::FanSpeedIn => &self.fan_speed_in,
            TopicKey::BacklightOut => &self.backlight_out,
            TopicKey::BacklightIn => &self.backlight_in,
            TopicKey::ConnectedOut => &self.connected_out,
        }
    }

    /// Keys whose stored topic differs from `other`
    pub fn diff(&self, other: &Topics) -> Vec<TopicKey> {
        use strum::IntoEnumIterator;

        TopicKey::iter()
            .filter(|key| self.get(*key) != other.get(*key))
            .collect()
    }
}
