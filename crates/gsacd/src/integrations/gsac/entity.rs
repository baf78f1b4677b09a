//! Entity runtime shared by every platform.
//!
//! Each entity is owned by one tokio task and is only ever touched from that
//! task. Everything that can change it (bus deliveries, availability
//! transitions, user commands, its own deferred work) arrives as an
//! [`EntityEvent`] in a single FIFO inbox, so messages on one topic are
//! applied in delivery order and no state is shared between entities.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::availability::AvailabilityManager;
use super::climate::ClimateState;
use super::number::NumberState;
use super::select::SelectState;
use super::sensor::SensorState;
use super::switch::SwitchState;
use crate::engine::Command;
use crate::engine::CommandError;
use crate::engine::EntityHandle;
use crate::engine::EntityInfo;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::integrations::mqtt::Bus;
use crate::integrations::mqtt::MqttMessage;
use crate::integrations::mqtt::QoS;
use crate::integrations::mqtt::Subscriber;
use crate::integrations::mqtt::Subscription;

pub type Inbox = mpsc::UnboundedSender<EntityEvent>;

pub enum EntityEvent {
    /// A bus delivery on one of the entity's topics
    Message(MqttMessage),

    /// Pushed by the availability manager on a transition
    Availability(bool),

    /// User command; the reply carries publish failures back to the caller
    Command(Command, oneshot::Sender<Result<(), CommandError>>),

    /// Work an inbound handler asked to run after it returned
    RunDeferred,

    /// The engine has registered the entity
    Activate,

    Snapshot(oneshot::Sender<EntityState>),

    Remove(oneshot::Sender<()>),
}

/// Returned by inbound handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    None,
    /// Post [`EntityEvent::RunDeferred`] to the entity's own inbox
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityState {
    Climate(ClimateState),
    Select(SelectState),
    Sensor(SensorState),
    Number(NumberState),
    Switch(SwitchState),
}

impl EntityState {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Bus subscriber that turns deliveries into inbox events
struct InboxSubscriber(Inbox);

impl Subscriber for InboxSubscriber {
    fn deliver(&self, message: &MqttMessage) {
        if self.0.send(EntityEvent::Message(message.clone())).is_err() {
            debug!("Inbox closed, dropping message on {}", message.topic);
        }
    }
}

/// Fields every entity carries
pub struct EntityCore {
    pub info: EntityInfo,
    pub bus: Arc<Bus>,
    available: bool,
    /// Set once the engine has registered the entity
    ready: bool,
    subscriptions: Vec<Subscription>,
    inbox: Inbox,
    inbox_rx: Option<mpsc::UnboundedReceiver<EntityEvent>>,
}

impl EntityCore {
    pub fn new(info: EntityInfo, bus: Arc<Bus>) -> Self {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        Self {
            info,
            bus,
            available: false,
            ready: false,
            subscriptions: Vec::new(),
            inbox,
            inbox_rx: Some(inbox_rx),
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.info.unique_id
    }

    pub fn available(&self) -> bool {
        self.available
    }

    async fn subscribe_all(&mut self, topics: Vec<(String, QoS)>) {
        let subscriber: Arc<dyn Subscriber> = Arc::new(InboxSubscriber(self.inbox.clone()));
        for (topic, qos) in topics {
            match self.bus.subscribe(&topic, qos, subscriber.clone()).await {
                Ok(subscription) => self.subscriptions.push(subscription),
                Err(e) => warn!("{}: failed to subscribe to {}: {}", self.unique_id(), topic, e),
            }
        }
    }

    async fn unsubscribe_all(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            let filter = subscription.filter().to_string();
            if let Err(e) = self.bus.unsubscribe(subscription).await {
                warn!("{}: failed to unsubscribe from {}: {}", self.info.unique_id, filter, e);
            }
        }
    }

    /// Publish a command payload
    pub async fn publish(&self, topic: &str, payload: &str, qos: QoS) -> Result<(), CommandError> {
        self.bus.publish(topic, payload, qos).await?;
        Ok(())
    }

    pub fn unsupported(&self, command: &Command) -> CommandError {
        CommandError::Unsupported {
            entity: self.info.unique_id.clone(),
            command: command.name(),
        }
    }
}

/// The synchronized-entity capability set.
///
/// Implementors provide the per-platform pieces; subscription lifecycle and
/// availability handling are shared.
#[async_trait]
pub trait Entity: Send + Sync + 'static {
    fn core(&self) -> &EntityCore;

    fn core_mut(&mut self) -> &mut EntityCore;

    /// Topics to subscribe while available, with their QoS
    fn inbound_topics(&self) -> Vec<(String, QoS)>;

    /// Apply an inbound message. Only called while available.
    fn handle_message(&mut self, message: &MqttMessage) -> Followup;

    /// Return displayed state to its "device state unknown" default
    fn reset_state(&mut self);

    fn state(&self) -> EntityState;

    /// Validate, publish, then update displayed state optimistically.
    /// Only called while available.
    async fn handle_command(&mut self, command: Command) -> Result<(), CommandError>;

    async fn run_deferred(&mut self) -> Result<(), CommandError> {
        Ok(())
    }

    async fn setup_subscriptions(&mut self) {
        let topics = self.inbound_topics();
        self.core_mut().subscribe_all(topics).await;
    }

    async fn teardown_subscriptions(&mut self) {
        self.core_mut().unsubscribe_all().await;
    }

    /// Returns whether anything changed
    async fn on_availability_changed(&mut self, available: bool) -> bool {
        if self.core().available == available {
            return false;
        }
        self.core_mut().available = available;
        debug!(
            "{}: availability changed to {}",
            self.core().unique_id(),
            available
        );

        if available {
            self.setup_subscriptions().await;
        } else {
            self.teardown_subscriptions().await;
            self.reset_state();
        }
        true
    }
}

/// Handle to a running entity task
pub struct EntityMailbox {
    unique_id: String,
    inbox: Inbox,
}

impl EntityMailbox {
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub async fn snapshot(&self) -> Option<EntityState> {
        let (tx, rx) = oneshot::channel();
        self.inbox.send(EntityEvent::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// Tear the entity down and wait for it to finish
    pub async fn remove(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inbox.send(EntityEvent::Remove(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

#[async_trait]
impl EntityHandle for EntityMailbox {
    fn activate(&self) {
        if self.inbox.send(EntityEvent::Activate).is_err() {
            debug!("{}: activated after shutdown", self.unique_id);
        }
    }

    async fn command(&self, command: Command) -> Result<(), CommandError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(EntityEvent::Command(command, tx))
            .map_err(|_| CommandError::Closed(self.unique_id.clone()))?;
        rx.await
            .map_err(|_| CommandError::Closed(self.unique_id.clone()))?
    }
}

/// Register the entity with its device's availability manager and start its
/// task.
pub fn spawn(
    mut entity: Box<dyn Entity>,
    availability: Arc<AvailabilityManager>,
    to_engine: FromIntegrationSender,
) -> (Arc<EntityMailbox>, JoinHandle<()>) {
    let core = entity.core_mut();
    let mailbox = Arc::new(EntityMailbox {
        unique_id: core.info.unique_id.clone(),
        inbox: core.inbox.clone(),
    });

    let (listener_id, available) = availability.register(core.inbox.clone());
    core.available = available;

    let Some(rx) = core.inbox_rx.take() else {
        warn!("{}: entity already started", core.info.unique_id);
        return (mailbox, tokio::spawn(async {}));
    };

    let task = tokio::spawn(async move {
        run(entity, rx, to_engine).await;
        availability.deregister(listener_id);
    });

    (mailbox, task)
}

async fn run(
    mut entity: Box<dyn Entity>,
    mut rx: mpsc::UnboundedReceiver<EntityEvent>,
    to_engine: FromIntegrationSender,
) {
    while let Some(event) = rx.recv().await {
        match event {
            EntityEvent::Message(message) => {
                if !entity.core().available {
                    debug!(
                        "{}: unavailable, dropping message on {}",
                        entity.core().unique_id(),
                        message.topic
                    );
                    continue;
                }
                if entity.handle_message(&message) == Followup::Deferred {
                    let _ = entity.core().inbox.send(EntityEvent::RunDeferred);
                }
                write_state(entity.as_ref(), &to_engine).await;
            }
            EntityEvent::Availability(available) => {
                if entity.on_availability_changed(available).await {
                    write_state(entity.as_ref(), &to_engine).await;
                }
            }
            EntityEvent::Command(command, reply) => {
                let result = if entity.core().available {
                    let result = entity.handle_command(command).await;
                    if result.is_ok() {
                        write_state(entity.as_ref(), &to_engine).await;
                    }
                    result
                } else {
                    warn!(
                        "{}: device unavailable, ignoring {}",
                        entity.core().unique_id(),
                        command.name()
                    );
                    Ok(())
                };
                let _ = reply.send(result);
            }
            EntityEvent::RunDeferred => {
                if let Err(e) = entity.run_deferred().await {
                    warn!("{}: deferred work failed: {}", entity.core().unique_id(), e);
                }
                write_state(entity.as_ref(), &to_engine).await;
            }
            EntityEvent::Activate => {
                entity.core_mut().ready = true;
                debug!("{}: registered", entity.core().unique_id());
                let core = entity.core();
                if core.available && core.subscriptions.is_empty() {
                    entity.setup_subscriptions().await;
                }
                write_state(entity.as_ref(), &to_engine).await;
            }
            EntityEvent::Snapshot(reply) => {
                let _ = reply.send(entity.state());
            }
            EntityEvent::Remove(done) => {
                entity.core_mut().ready = false;
                entity.teardown_subscriptions().await;
                info!("{}: removed", entity.core().unique_id());
                let _ = done.send(());
                break;
            }
        }
    }
}

/// Report state to the engine, unless the entity is not registered yet
async fn write_state(entity: &dyn Entity, to_engine: &FromIntegrationSender) {
    let core = entity.core();
    if !core.ready {
        debug!("{}: not registered yet, skipping state write", core.unique_id());
        return;
    }

    let msg = FromIntegrationMessage::StateChanged {
        unique_id: core.info.unique_id.clone(),
        available: core.available,
        state: entity.state().to_json(),
    };
    if let Err(e) = to_engine.send(msg).await {
        warn!("Failed to send StateChanged message: {}", e);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Harness for driving one entity against a mock broker

    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::engine::EntityKind;
    use crate::integrations::gsac::device_id::DeviceId;
    use crate::integrations::gsac::topics::Topics;
    use crate::integrations::mqtt::MockHandle;
    use crate::integrations::mqtt::MockMqttClient;

    pub const DEVICE: &str = "1cdbd4cbcc74";

    pub struct Harness {
        pub bus: Arc<Bus>,
        pub mqtt: MockHandle,
        pub availability: Arc<AvailabilityManager>,
        pub topics: Topics,
        pub engine_rx: mpsc::Receiver<FromIntegrationMessage>,
        engine_tx: FromIntegrationSender,
    }

    impl Harness {
        pub fn new() -> Self {
            let client = MockMqttClient::new();
            let mqtt = client.handle();
            let bus = Bus::new(client);
            let device_id = DeviceId::parse(DEVICE).unwrap();
            let topics = Topics::for_device(&device_id);
            let availability =
                AvailabilityManager::new(device_id, topics.connected_out.clone());
            let (engine_tx, engine_rx) = mpsc::channel(256);
            Self {
                bus,
                mqtt,
                availability,
                topics,
                engine_rx,
                engine_tx,
            }
        }

        pub fn info(&self, unique_id: &str, kind: EntityKind) -> EntityInfo {
            EntityInfo {
                unique_id: unique_id.to_string(),
                kind,
                device_id: DEVICE.to_string(),
                name: unique_id.to_string(),
            }
        }

        pub fn sender(&self) -> FromIntegrationSender {
            self.engine_tx.clone()
        }

        /// Start the entity and register it, as device setup does
        pub async fn start(&self, entity: Box<dyn Entity>) -> Arc<EntityMailbox> {
            let (mailbox, _task) = spawn(entity, self.availability.clone(), self.engine_tx.clone());
            mailbox.activate();
            mailbox.snapshot().await.unwrap();
            mailbox
        }

        /// Deliver a message through the bus, as the broker would
        pub fn inject(&self, topic: &str, payload: &str) {
            self.bus.dispatch(&MqttMessage::new(topic, payload));
        }

        pub async fn set_available(&self, mailbox: &EntityMailbox, available: bool) {
            self.availability
                .handle_payload(if available { "1" } else { "0" });
            // The inbox is FIFO, so the snapshot waits for the transition
            mailbox.snapshot().await.unwrap();
        }

        /// Wait for the next state the entity reports to the engine
        pub async fn next_reported(&mut self) -> (bool, serde_json::Value) {
            loop {
                let msg = tokio::time::timeout(Duration::from_secs(1), self.engine_rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if let FromIntegrationMessage::StateChanged {
                    available, state, ..
                } = msg
                {
                    return (available, state);
                }
            }
        }
    }
}
