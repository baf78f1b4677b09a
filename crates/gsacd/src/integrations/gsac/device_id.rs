use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Number of hex characters in a device identifier
pub const DEVICE_ID_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceIdError {
    #[error("device id is required")]
    Required,

    #[error("device id must be {DEVICE_ID_LEN} characters, got {0}")]
    Length(usize),

    #[error("device id may only contain 0-9 and a-f")]
    Format,
}

impl DeviceIdError {
    /// Form error key reported against the `device_id` field
    pub fn form_key(&self) -> &'static str {
        match self {
            DeviceIdError::Required => "device_id_required",
            DeviceIdError::Length(_) => "device_id_length",
            DeviceIdError::Format => "device_id_format",
        }
    }
}

/// Identifier of one physical air conditioner.
///
/// Twelve hex characters, case-insensitive. The original casing is kept
/// because the device publishes on topics spelled exactly as configured.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self, DeviceIdError> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(DeviceIdError::Required);
        }

        let len = id.chars().count();
        if len != DEVICE_ID_LEN {
            return Err(DeviceIdError::Length(len));
        }

        if !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DeviceIdError::Format);
        }

        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether two identifiers name the same device, ignoring case
    pub fn same_device(&self, other: &DeviceId) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DeviceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        for raw in ["1cdbd4cbcc74", "1CDBD4CBCC74", "000000000000", "  abcdefABCDEF "] {
            let id = DeviceId::parse(raw).unwrap();
            assert_eq!(id.as_str(), raw.trim());
        }
    }

    #[test]
    fn test_invalid_ids() {
        assert_eq!(DeviceId::parse(""), Err(DeviceIdError::Required));
        assert_eq!(DeviceId::parse("   "), Err(DeviceIdError::Required));
        assert_eq!(DeviceId::parse("1cdbd4"), Err(DeviceIdError::Length(6)));
        assert_eq!(
            DeviceId::parse("1cdbd4cbcc74ff"),
            Err(DeviceIdError::Length(14))
        );
        assert_eq!(DeviceId::parse("1cdbd4cbcc7g"), Err(DeviceIdError::Format));
        assert_eq!(DeviceId::parse("1cdbd4cbcc7-"), Err(DeviceIdError::Format));
    }

    #[test]
    fn test_multibyte_length_counts_chars() {
        // Twelve characters but more than twelve bytes
        assert_eq!(DeviceId::parse("ж1cdbd4cbcc7"), Err(DeviceIdError::Format));
        assert_eq!(DeviceId::parse("жжж"), Err(DeviceIdError::Length(3)));
    }

    #[test]
    fn test_form_keys() {
        assert_eq!(DeviceIdError::Required.form_key(), "device_id_required");
        assert_eq!(DeviceIdError::Length(3).form_key(), "device_id_length");
        assert_eq!(DeviceIdError::Format.form_key(), "device_id_format");
    }

    #[test]
    fn test_same_device_ignores_case() {
        let a = DeviceId::parse("1cdbd4cbcc74").unwrap();
        let b = DeviceId::parse("1CDBD4CBCC74").unwrap();
        assert_ne!(a, b);
        assert!(a.same_device(&b));
    }

    #[test]
    fn test_deserialize_validates() {
        #[derive(Deserialize)]
        struct Record {
            device_id: DeviceId,
        }

        let ok: Record = toml::from_str(r#"device_id = "1cdbd4cbcc74""#).unwrap();
        assert_eq!(ok.device_id.as_str(), "1cdbd4cbcc74");

        assert!(toml::from_str::<Record>(r#"device_id = "nothex""#).is_err());
    }
}
