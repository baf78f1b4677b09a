use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;

use super::entity::Command;
use super::entity::CommandError;
use super::entity::EntityHandle;
use super::message::FromIntegrationMessage;
use super::state::EntityRecord;
use super::state::State;

/// Channel types for messages FROM integrations TO the engine
pub type FromIntegrationSender = mpsc::Sender<FromIntegrationMessage>;
pub type FromIntegrationReceiver = mpsc::Receiver<FromIntegrationMessage>;

/// Capacity for the integration→engine message channel
/// Provides backpressure when entities write faster than the engine can process
const FROM_INTEGRATION_CHANNEL_SIZE: usize = 1024;

/// gsacd engine
///
/// Stands in for the host platform: keeps the entity registry and a view of
/// every entity's state, and routes user commands to the owning entity.
pub struct Engine {
    /// Centralized state snapshot (readers clone the Arc, writer swaps it)
    state: RwLock<Arc<State>>,

    /// Map of unique_id -> handle for routing commands
    handles: std::sync::Mutex<HashMap<String, Arc<dyn EntityHandle>>>,

    /// Receive messages from integrations
    message_rx: Mutex<FromIntegrationReceiver>,

    /// Sender for integrations to report back to the engine
    message_tx: FromIntegrationSender,
}

impl Engine {
    pub fn new() -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_INTEGRATION_CHANNEL_SIZE);
        Self {
            state: RwLock::new(Arc::default()),
            handles: std::sync::Mutex::new(HashMap::new()),
            message_rx: Mutex::new(message_rx),
            message_tx,
        }
    }

    pub fn sender(&self) -> FromIntegrationSender {
        self.message_tx.clone()
    }

    /// Run the engine's main loop until every sender is gone
    pub async fn run(&self) {
        info!("Engine starting");

        let mut rx = self.message_rx.lock().await;
        while let Some(msg) = rx.recv().await {
            self.handle_message(msg);
        }

        info!("Engine shutting down");
    }

    /// Get a snapshot of the current engine state.
    pub fn state_snapshot(&self) -> Arc<State> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Route a command to the entity that owns `unique_id`
    pub async fn send_command(&self, unique_id: &str, command: Command) -> Result<(), CommandError> {
        let handle = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(unique_id)
            .cloned()
            .ok_or_else(|| CommandError::NotFound(unique_id.to_string()))?;

        handle.command(command).await
    }

    fn update_state(&self, f: impl FnOnce(&mut State)) {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut state = State::clone(&guard);
        f(&mut state);
        *guard = Arc::new(state);
    }

    fn handle_message(&self, msg: FromIntegrationMessage) {
        match msg {
            FromIntegrationMessage::EntityAdded { info, handle } => {
                info!("Entity added: {} ({:?})", info.unique_id, info.kind);

                let unique_id = info.unique_id.clone();
                self.update_state(|state| {
                    state.entities.insert(
                        unique_id.clone(),
                        EntityRecord {
                            info,
                            available: false,
                            state: serde_json::Value::Null,
                        },
                    );
                });

                self.handles
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(unique_id, handle.clone());

                handle.activate();
            }
            FromIntegrationMessage::EntityRemoved { unique_id } => {
                info!("Entity removed: {}", unique_id);

                self.update_state(|state| {
                    state.entities.remove(&unique_id);
                });
                self.handles
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&unique_id);
            }
            FromIntegrationMessage::StateChanged {
                unique_id,
                available,
                state: entity_state,
            } => {
                debug!(
                    "State changed: {} -> available={}, {}",
                    unique_id, available, entity_state
                );

                self.update_state(|state| match state.entities.get_mut(&unique_id) {
                    Some(record) => {
                        record.available = available;
                        record.state = entity_state;
                    }
                    None => debug!("Dropping state for unregistered entity {}", unique_id),
                });
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
