use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::codec::CONNECTED_OFFLINE;
use super::codec::CONNECTED_ONLINE;
use super::device_id::DeviceId;
use super::entity::EntityEvent;
use crate::integrations::mqtt::Bus;
use crate::integrations::mqtt::ClientError;
use crate::integrations::mqtt::MqttMessage;
use crate::integrations::mqtt::QoS;
use crate::integrations::mqtt::Subscriber;
use crate::integrations::mqtt::Subscription;

pub type ListenerId = u64;

type Listener = mpsc::UnboundedSender<EntityEvent>;

struct Inner {
    available: bool,
    listeners: HashMap<ListenerId, Listener>,
}

/// Tracks whether one device is reachable and tells its entities.
///
/// Transitions are computed under a single lock, so a duplicated sentinel
/// can never produce a second fan-out. Fan-out only enqueues an event into
/// each entity's inbox; a slow entity never holds up the others.
pub struct AvailabilityManager {
    device_id: DeviceId,
    topic: String,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    subscription: tokio::sync::Mutex<Option<Subscription>>,
}

impl AvailabilityManager {
    pub fn new(device_id: DeviceId, topic: String) -> Arc<Self> {
        Arc::new(Self {
            device_id,
            topic,
            inner: Mutex::new(Inner {
                available: false,
                listeners: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            subscription: tokio::sync::Mutex::new(None),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start listening on the device's connectivity topic.
    pub async fn subscribe(self: &Arc<Self>, bus: &Bus) -> Result<(), ClientError> {
        self.lock().available = false;

        let subscriber: Arc<dyn Subscriber> = self.clone();
        let subscription = bus
            .subscribe(&self.topic, QoS::AtLeastOnce, subscriber)
            .await?;
        *self.subscription.lock().await = Some(subscription);

        debug!("Device {}: watching {}", self.device_id, self.topic);
        Ok(())
    }

    pub async fn unsubscribe(&self, bus: &Bus) -> Result<(), ClientError> {
        if let Some(subscription) = self.subscription.lock().await.take() {
            bus.unsubscribe(subscription).await?;
        }
        Ok(())
    }

    pub fn available(&self) -> bool {
        self.lock().available
    }

    /// Add a listener and return the current availability to prime it with.
    ///
    /// Both happen under the same lock, so the listener either sees a
    /// transition as an event or already has it in the primed value.
    pub fn register(&self, listener: Listener) -> (ListenerId, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        inner.listeners.insert(id, listener);
        (id, inner.available)
    }

    pub fn deregister(&self, id: ListenerId) {
        self.lock().listeners.remove(&id);
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Apply one connectivity payload. Returns true on a transition.
    pub fn handle_payload(&self, payload: &str) -> bool {
        let available = match payload {
            CONNECTED_ONLINE => true,
            CONNECTED_OFFLINE => false,
            other => {
                warn!(
                    "Device {}: ignoring connectivity payload {:?}",
                    self.device_id, other
                );
                return false;
            }
        };

        let mut inner = self.lock();
        if inner.available == available {
            debug!(
                "Device {}: already {}",
                self.device_id,
                if available { "online" } else { "offline" }
            );
            return false;
        }
        inner.available = available;

        info!(
            "Device {} is now {}",
            self.device_id,
            if available { "online" } else { "offline" }
        );

        for (id, listener) in &inner.listeners {
            if listener.send(EntityEvent::Availability(available)).is_err() {
                debug!("Listener {} has gone away", id);
            }
        }
        true
    }
}

impl Subscriber for AvailabilityManager {
    fn deliver(&self, message: &MqttMessage) {
        self.handle_payload(&message.payload_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::mqtt::MockMqttClient;

    fn manager() -> Arc<AvailabilityManager> {
        AvailabilityManager::new(
            DeviceId::parse("1cdbd4cbcc74").unwrap(),
            "1cdbd4cbcc74/connected/out".to_string(),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EntityEvent>) -> Vec<bool> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EntityEvent::Availability(v) = event {
                seen.push(v);
            }
        }
        seen
    }

    #[test]
    fn test_starts_unavailable() {
        assert!(!manager().available());
    }

    #[test]
    fn test_duplicate_sentinel_notifies_once() {
        let manager = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register(tx);

        assert!(manager.handle_payload("1"));
        assert!(!manager.handle_payload("1"));
        assert_eq!(drain(&mut rx), vec![true]);

        assert!(manager.handle_payload("0"));
        assert!(!manager.handle_payload("0"));
        assert_eq!(drain(&mut rx), vec![false]);
    }

    #[test]
    fn test_other_payloads_ignored() {
        let manager = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register(tx);

        for payload in ["online", "", "2", " 1"] {
            assert!(!manager.handle_payload(payload));
        }
        assert!(!manager.available());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_register_primes_current_value() {
        let manager = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(!manager.register(tx).1);

        manager.handle_payload("1");
        let (late_tx, mut late_rx) = mpsc::unbounded_channel();
        assert!(manager.register(late_tx).1);

        // The late listener is primed, not notified
        assert!(drain(&mut late_rx).is_empty());
        assert_eq!(drain(&mut rx), vec![true]);
    }

    #[test]
    fn test_fanout_survives_dead_listener() {
        let manager = manager();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register(dead_tx);
        manager.register(tx);

        assert!(manager.handle_payload("1"));
        assert_eq!(drain(&mut rx), vec![true]);
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let manager = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (id, _) = manager.register(tx);
        assert_eq!(manager.listener_count(), 1);

        manager.deregister(id);
        manager.deregister(id);
        manager.deregister(9999);
        assert_eq!(manager.listener_count(), 0);

        manager.handle_payload("1");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_subscribes_through_bus() {
        let client = MockMqttClient::new();
        let handle = client.handle();
        let bus = Bus::new(client);
        let manager = manager();

        manager.subscribe(&bus).await.unwrap();
        assert_eq!(
            handle.subscription_qos("1cdbd4cbcc74/connected/out"),
            Some(QoS::AtLeastOnce)
        );

        bus.dispatch(&MqttMessage::new("1cdbd4cbcc74/connected/out", "1"));
        assert!(manager.available());

        manager.unsubscribe(&bus).await.unwrap();
        assert_eq!(
            handle.unsubscriptions(),
            vec!["1cdbd4cbcc74/connected/out".to_string()]
        );
        assert_eq!(bus.route_count("1cdbd4cbcc74/connected/out"), 0);
    }
}
