//! Command surface shared by every entity.
//!
//! The engine never touches entity state directly. It holds an
//! [`EntityHandle`] per entity and forwards user commands through it.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use strum::IntoStaticStr;

use crate::integrations::mqtt::ClientError;

/// A user-issued command. Values are validated by the receiving entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "command", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Command {
    SetHvacMode { hvac_mode: String },
    SetTemperature { temperature: f64 },
    SetFanMode { fan_mode: String },
    SetSwingMode { swing_mode: String },
    TurnOn,
    TurnOff,
    SelectOption { option: String },
    SetValue { value: f64 },
}

impl Command {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// Errors that escape a command.
///
/// Invalid values are not errors: the entity logs them and leaves its state
/// alone. Only routing failures and failed publishes surface here.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to publish command: {0}")]
    Publish(#[from] ClientError),

    #[error("{entity} does not support {command}")]
    Unsupported {
        entity: String,
        command: &'static str,
    },

    #[error("entity {0} is not running")]
    Closed(String),

    #[error("no entity with id {0}")]
    NotFound(String),
}

#[async_trait]
pub trait EntityHandle: Send + Sync {
    /// Called once the engine has recorded the entity; state writes are
    /// accepted from then on.
    fn activate(&self);

    /// Run a command to completion, including the publish
    async fn command(&self, command: Command) -> Result<(), CommandError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json() {
        let cmd: Command =
            serde_json::from_str(r#"{"command": "set_hvac_mode", "hvac_mode": "fan_only"}"#)
                .unwrap();
        assert_eq!(
            cmd,
            Command::SetHvacMode {
                hvac_mode: "fan_only".to_string()
            }
        );
        assert_eq!(cmd.name(), "set_hvac_mode");

        let cmd: Command = serde_json::from_str(r#"{"command": "turn_off"}"#).unwrap();
        assert_eq!(cmd, Command::TurnOff);

        assert!(serde_json::from_str::<Command>(r#"{"command": "explode"}"#).is_err());
    }
}
