use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rumqttc::QoS;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::trace;

use super::client::ClientError;
use super::client::MqttClient;
use super::client::MqttMessage;
use super::topic;

/// Receiver of messages routed by the [`Bus`].
///
/// `deliver` runs on the dispatch loop and must only enqueue work.
pub trait Subscriber: Send + Sync {
    fn deliver(&self, message: &MqttMessage);
}

type SubscriptionId = u64;

/// Handle for one route in the bus. Owned by whoever subscribed; handing it
/// back to [`Bus::unsubscribe`] cancels the route.
#[derive(Debug, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriptionId,
    filter: String,
}

impl Subscription {
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

struct Route {
    id: SubscriptionId,
    subscriber: Arc<dyn Subscriber>,
}

/// Subscription layer over a single MQTT connection.
///
/// Routes inbound messages to every subscriber whose filter matches, and
/// reference-counts broker subscriptions so that a topic shared by several
/// entities stays subscribed until the last of them lets go.
pub struct Bus {
    client: Mutex<Box<dyn MqttClient>>,
    routes: std::sync::Mutex<HashMap<String, Vec<Route>>>,
    next_id: AtomicU64,
}

impl Bus {
    pub fn new(client: impl MqttClient + 'static) -> Arc<Self> {
        Arc::new(Self {
            client: Mutex::new(Box::new(client)),
            routes: std::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Connect the client and spawn the dispatch loop.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, ClientError> {
        let mut stream = {
            let mut client = self.client.lock().await;
            client.connect().await?
        };

        let bus = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(msg) = stream.recv().await {
                let Some(bus) = bus.upgrade() else {
                    break;
                };
                bus.dispatch(&msg);
            }
            info!("MQTT dispatch loop exiting");
        });

        Ok(task)
    }

    /// Route one inbound message. Returns the number of subscribers reached.
    pub fn dispatch(&self, message: &MqttMessage) -> usize {
        let targets: Vec<Arc<dyn Subscriber>> = {
            let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            routes
                .iter()
                .filter(|(filter, _)| topic::matches(filter, &message.topic))
                .flat_map(|(_, list)| list.iter().map(|r| r.subscriber.clone()))
                .collect()
        };

        if targets.is_empty() {
            trace!("No subscriber for message on {}", message.topic);
        }

        for target in &targets {
            target.deliver(message);
        }
        targets.len()
    }

    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<Subscription, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Insert the route before subscribing so the retained message finds
        // it, regardless of how fast the broker answers.
        {
            let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            routes
                .entry(filter.to_string())
                .or_default()
                .push(Route { id, subscriber });
        }

        let result = {
            let mut client = self.client.lock().await;
            client.subscribe(filter, qos).await
        };

        if let Err(e) = result {
            self.remove_route(filter, id);
            return Err(e);
        }

        debug!("Subscribed to {} ({:?}, route {})", filter, qos, id);
        Ok(Subscription {
            id,
            filter: filter.to_string(),
        })
    }

    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<(), ClientError> {
        let last = self.remove_route(&subscription.filter, subscription.id);
        debug!(
            "Cancelled route {} on {}",
            subscription.id, subscription.filter
        );

        if last {
            let mut client = self.client.lock().await;
            client.unsubscribe(&subscription.filter).await?;
        }
        Ok(())
    }

    /// Returns true when the filter has no routes left.
    fn remove_route(&self, filter: &str, id: SubscriptionId) -> bool {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = routes.get_mut(filter) else {
            return false;
        };
        list.retain(|r| r.id != id);
        if list.is_empty() {
            routes.remove(filter);
            true
        } else {
            false
        }
    }

    pub async fn publish(&self, topic: &str, payload: &str, qos: QoS) -> Result<(), ClientError> {
        debug!("Publishing {} -> {}", topic, payload);
        let mut client = self.client.lock().await;
        client.publish(topic, payload.as_bytes(), qos, false).await
    }

    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_connected()
    }

    /// Number of live routes for an exact filter
    pub fn route_count(&self, filter: &str) -> usize {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.get(filter).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::integrations::mqtt::MockMqttClient;

    struct Forward(mpsc::UnboundedSender<MqttMessage>);

    impl Subscriber for Forward {
        fn deliver(&self, message: &MqttMessage) {
            let _ = self.0.send(message.clone());
        }
    }

    fn forward() -> (Arc<Forward>, mpsc::UnboundedReceiver<MqttMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Forward(tx)), rx)
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_filter() {
        let bus = Bus::new(MockMqttClient::new());
        let (mode, mut mode_rx) = forward();
        let (all, mut all_rx) = forward();

        bus.subscribe("dev/mode/out", QoS::AtLeastOnce, mode)
            .await
            .unwrap();
        bus.subscribe("dev/#", QoS::AtMostOnce, all).await.unwrap();

        assert_eq!(bus.dispatch(&MqttMessage::new("dev/mode/out", "2")), 2);
        assert_eq!(bus.dispatch(&MqttMessage::new("dev/power/out", "1")), 1);
        assert_eq!(bus.dispatch(&MqttMessage::new("other/mode/out", "1")), 0);

        assert_eq!(mode_rx.try_recv().unwrap().payload, b"2");
        assert!(mode_rx.try_recv().is_err());
        assert_eq!(all_rx.try_recv().unwrap().topic, "dev/mode/out");
        assert_eq!(all_rx.try_recv().unwrap().topic, "dev/power/out");
    }

    #[tokio::test]
    async fn test_broker_unsubscribe_waits_for_last_route() {
        let client = MockMqttClient::new();
        let handle = client.handle();
        let bus = Bus::new(client);
        let (a, _a_rx) = forward();
        let (b, _b_rx) = forward();

        let sub_a = bus.subscribe("dev/mode/out", QoS::AtLeastOnce, a).await.unwrap();
        let sub_b = bus.subscribe("dev/mode/out", QoS::AtMostOnce, b).await.unwrap();
        assert_eq!(bus.route_count("dev/mode/out"), 2);
        // Every route re-subscribes so the broker replays the retained value.
        assert_eq!(handle.subscriptions().len(), 2);

        bus.unsubscribe(sub_a).await.unwrap();
        assert!(handle.unsubscriptions().is_empty());
        assert_eq!(bus.route_count("dev/mode/out"), 1);

        bus.unsubscribe(sub_b).await.unwrap();
        assert_eq!(handle.unsubscriptions(), vec!["dev/mode/out".to_string()]);
        assert_eq!(bus.route_count("dev/mode/out"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_route_stops_delivery() {
        let bus = Bus::new(MockMqttClient::new());
        let (a, mut a_rx) = forward();

        let sub = bus.subscribe("dev/power/out", QoS::AtLeastOnce, a).await.unwrap();
        bus.unsubscribe(sub).await.unwrap();

        assert_eq!(bus.dispatch(&MqttMessage::new("dev/power/out", "1")), 0);
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_dispatches_inbound_stream() {
        let client = MockMqttClient::new();
        let handle = client.handle();
        let bus = Bus::new(client);
        let (a, mut a_rx) = forward();
        bus.subscribe("dev/connected/out", QoS::AtLeastOnce, a)
            .await
            .unwrap();

        assert!(!bus.is_connected().await);
        let _task = bus.start().await.unwrap();
        assert!(bus.is_connected().await);

        handle.inject("dev/connected/out", "1");
        let msg = tokio::time::timeout(Duration::from_secs(1), a_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload_str(), "1");
    }

    #[tokio::test]
    async fn test_publish_uses_client() {
        let client = MockMqttClient::new();
        let handle = client.handle();
        let bus = Bus::new(client);

        bus.publish("dev/mode/in", "5", QoS::AtMostOnce).await.unwrap();
        assert_eq!(
            handle.published(),
            vec![("dev/mode/in".to_string(), "5".to_string())]
        );

        handle.fail_publishes(true);
        assert!(bus.publish("dev/mode/in", "0", QoS::AtMostOnce).await.is_err());
    }
}
