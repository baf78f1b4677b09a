mod engine;
mod entity;
mod message;
pub mod state;

pub use engine::Engine;
pub use engine::FromIntegrationSender;
pub use entity::Command;
pub use entity::CommandError;
pub use entity::EntityHandle;
pub use message::FromIntegrationMessage;
pub use state::EntityInfo;
pub use state::EntityKind;
pub use state::EntityRecord;
pub use state::State;
