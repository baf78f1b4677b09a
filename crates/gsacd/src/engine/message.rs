//! Messages from integrations to the engine

use std::sync::Arc;

use super::entity::EntityHandle;
use super::state::EntityInfo;

pub enum FromIntegrationMessage {
    /// An entity was created and wants to be registered
    EntityAdded {
        info: EntityInfo,
        handle: Arc<dyn EntityHandle>,
    },

    /// An entity was torn down
    EntityRemoved { unique_id: String },

    /// An entity wrote new state
    StateChanged {
        unique_id: String,
        available: bool,
        state: serde_json::Value,
    },
}

impl std::fmt::Debug for FromIntegrationMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FromIntegrationMessage::EntityAdded { info, .. } => f
                .debug_struct("EntityAdded")
                .field("info", info)
                .field("handle", &"<handle>")
                .finish(),
            FromIntegrationMessage::EntityRemoved { unique_id } => f
                .debug_struct("EntityRemoved")
                .field("unique_id", unique_id)
                .finish(),
            FromIntegrationMessage::StateChanged {
                unique_id,
                available,
                state,
            } => f
                .debug_struct("StateChanged")
                .field("unique_id", unique_id)
                .field("available", available)
                .field("state", state)
                .finish(),
        }
    }
}
