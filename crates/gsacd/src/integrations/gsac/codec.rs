//! Wire vocabulary of the air conditioner.
//!
//! Every discrete value the device understands travels as a one-character
//! code. Each enum here knows its code, the key used in entity state and
//! commands (`fan_only`, `medium`, ...), the human label shown by selectors,
//! and an icon.

use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;
use strum::IntoEnumIterator;
use strum::IntoStaticStr;

pub const TEMP_MIN: i64 = 16;
pub const TEMP_MAX: i64 = 30;
pub const TEMP_STEP: i64 = 1;
pub const TEMP_DEFAULT: i64 = 22;

/// Payloads on `connected/out`
pub const CONNECTED_ONLINE: &str = "1";
pub const CONNECTED_OFFLINE: &str = "0";

/// A value with a fixed single-code wire encoding
pub trait WireCode: Copy + Eq + IntoEnumIterator + Into<&'static str> + 'static {
    fn code(self) -> &'static str;

    fn label(self) -> &'static str;

    fn icon(self) -> &'static str;

    fn key(self) -> &'static str {
        self.into()
    }

    fn from_code(code: &str) -> Option<Self> {
        Self::iter().find(|v| v.code() == code)
    }

    fn from_label(label: &str) -> Option<Self> {
        Self::iter().find(|v| v.label() == label)
    }

    fn from_key(key: &str) -> Option<Self> {
        Self::iter().find(|v| v.key() == key)
    }

    fn labels() -> Vec<&'static str> {
        Self::iter().map(Self::label).collect()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HvacMode {
    #[default]
    Off,
    Auto,
    Cool,
    Dry,
    Heat,
    FanOnly,
}

impl WireCode for HvacMode {
    fn code(self) -> &'static str {
        match self {
            HvacMode::Off => "0",
            HvacMode::Auto => "1",
            HvacMode::Cool => "2",
            HvacMode::Dry => "3",
            HvacMode::Heat => "4",
            HvacMode::FanOnly => "5",
        }
    }

    fn label(self) -> &'static str {
        match self {
            HvacMode::Off => "Off",
            HvacMode::Auto => "Auto",
            HvacMode::Cool => "Cool",
            HvacMode::Dry => "Dry",
            HvacMode::Heat => "Heat",
            HvacMode::FanOnly => "Fan only",
        }
    }

    fn icon(self) -> &'static str {
        match self {
            HvacMode::Off => "mdi:power-off",
            HvacMode::Auto => "mdi:auto-mode",
            HvacMode::Cool => "mdi:snowflake",
            HvacMode::Dry => "mdi:water",
            HvacMode::Heat => "mdi:fire",
            HvacMode::FanOnly => "mdi:fan",
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FanSpeed {
    #[default]
    Auto,
    Low,
    Medium,
    High,
}

impl WireCode for FanSpeed {
    fn code(self) -> &'static str {
        match self {
            FanSpeed::Auto => "0",
            FanSpeed::Low => "1",
            FanSpeed::Medium => "2",
            FanSpeed::High => "3",
        }
    }

    fn label(self) -> &'static str {
        match self {
            FanSpeed::Auto => "Auto",
            FanSpeed::Low => "Low",
            FanSpeed::Medium => "Medium",
            FanSpeed::High => "High",
        }
    }

    fn icon(self) -> &'static str {
        match self {
            FanSpeed::Auto => "mdi:fan-auto",
            FanSpeed::Low => "mdi:fan-speed-1",
            FanSpeed::Medium => "mdi:fan-speed-2",
            FanSpeed::High => "mdi:fan-speed-3",
        }
    }
}

/// Horizontal louvre position, carried on the `backlight_auto` topics
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SwingMode {
    On,
    #[default]
    Off,
}

impl WireCode for SwingMode {
    fn code(self) -> &'static str {
        match self {
            SwingMode::On => "1",
            SwingMode::Off => "0",
        }
    }

    fn label(self) -> &'static str {
        match self {
            SwingMode::On => "On",
            SwingMode::Off => "Off",
        }
    }

    fn icon(self) -> &'static str {
        match self {
            SwingMode::On => "mdi:blinds-horizontal",
            SwingMode::Off => "mdi:blinds-horizontal-closed",
        }
    }
}

impl From<bool> for SwingMode {
    fn from(on: bool) -> Self {
        if on {
            SwingMode::On
        } else {
            SwingMode::Off
        }
    }
}

/// What the unit is doing, derived from the mode alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacAction {
    #[default]
    Off,
    Cooling,
    Heating,
    Fan,
    Idle,
}

impl From<HvacMode> for HvacAction {
    fn from(mode: HvacMode) -> Self {
        match mode {
            HvacMode::Off => HvacAction::Off,
            HvacMode::Cool => HvacAction::Cooling,
            HvacMode::Heat => HvacAction::Heating,
            HvacMode::FanOnly => HvacAction::Fan,
            HvacMode::Auto | HvacMode::Dry => HvacAction::Idle,
        }
    }
}

/// Parse a decimal temperature payload. Non-finite values count as malformed.
pub fn parse_temperature(payload: &str) -> Option<f64> {
    payload
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
}
