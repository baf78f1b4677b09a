use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Platform an entity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Climate,
    Select,
    Sensor,
    Number,
    Switch,
}

/// Static description of an entity, fixed when it is added.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityInfo {
    pub unique_id: String,
    pub kind: EntityKind,
    pub device_id: String,
    pub name: String,
}

/// One entity as the engine last saw it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    #[serde(flatten)]
    pub info: EntityInfo,

    pub available: bool,

    /// Platform-specific state; `null` until the entity first reports.
    pub state: serde_json::Value,
}

/// Centralized snapshot of every entity, keyed by unique id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub entities: BTreeMap<String, EntityRecord>,
}

impl State {
    pub fn get(&self, unique_id: &str) -> Option<&EntityRecord> {
        self.entities.get(unique_id)
    }
}
