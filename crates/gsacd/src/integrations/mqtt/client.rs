use std::borrow::Cow;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing;

use super::MqttConfig;

/// MQTT message received from a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl MqttMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Payload decoded as UTF-8; invalid sequences are replaced, which makes
    /// them fail every wire-code lookup downstream.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Stream of every publish the broker delivers on this connection
pub type MessageStream = mpsc::UnboundedReceiver<MqttMessage>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("MQTT client not connected. Call connect() first.")]
    NotConnected,

    #[error("MQTT request failed: {0}")]
    Request(#[from] rumqttc::ClientError),

    #[error("MQTT request rejected: {0}")]
    Rejected(String),
}

/// Trait for MQTT client operations
///
/// This trait allows for mocking the MQTT client for testing purposes
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Connect to the MQTT broker and hand back the inbound message stream
    async fn connect(&mut self) -> Result<MessageStream, ClientError>;

    /// Whether the broker has acknowledged the connection
    fn is_connected(&self) -> bool;

    /// Subscribe to an MQTT topic filter
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ClientError>;

    /// Unsubscribe from an MQTT topic filter
    async fn unsubscribe(&mut self, topic: &str) -> Result<(), ClientError>;

    /// Publish a message to an MQTT topic
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError>;
}

/// Real MQTT client implementation using rumqttc
pub struct RumqttcClient {
    /// MQTT connection options (stored for lazy initialization)
    mqtt_options: MqttOptions,

    /// AsyncClient (created in connect())
    client: Option<AsyncClient>,

    /// Set on ConnAck, cleared on event loop errors
    connected: Arc<AtomicBool>,

    /// Background event loop task handle
    event_loop_task: Option<JoinHandle<()>>,
}

impl RumqttcClient {
    /// Create a new RumqttcClient from configuration
    pub fn new(config: &MqttConfig) -> Self {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);

        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        // Broker keeps our subscriptions across reconnects of the same client id.
        mqtt_options.set_clean_session(false);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        Self {
            mqtt_options,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            event_loop_task: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, ClientError> {
        self.client.as_ref().ok_or(ClientError::NotConnected)
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<MessageStream, ClientError> {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }

        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let connected = self.connected.clone();

        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                            retain: publish.retain,
                        };

                        // Send to channel; if receiver dropped, exit
                        if message_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        tracing::info!(
                            "MQTT connection acknowledged (session present: {})",
                            ack.session_present
                        );
                        connected.store(true, Ordering::SeqCst);
                    }
                    Ok(_) => {
                        // Ignore other events (suback, puback, pings, ...)
                    }
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        tracing::warn!("MQTT event loop error: {}", e);
                        // Sleep briefly before retrying
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            tracing::info!("MQTT event loop task exiting");
        });

        self.client = Some(client);
        self.event_loop_task = Some(task);

        Ok(message_rx)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ClientError> {
        self.client()?.subscribe(topic, qos).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), ClientError> {
        self.client()?.unsubscribe(topic).await?;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        self.client()?
            .publish(topic, qos, retain, payload.to_vec())
            .await?;
        Ok(())
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}

/// Everything the mock client has been asked to do
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockLog {
    pub subscriptions: Vec<(String, QoS)>,
    pub unsubscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>, QoS, bool)>,
}

/// Mock MQTT client for testing
#[cfg(test)]
pub struct MockMqttClient {
    log: Arc<std::sync::Mutex<MockLog>>,
    inbound_tx: mpsc::UnboundedSender<MqttMessage>,
    inbound_rx: Option<MessageStream>,
    connected: Arc<AtomicBool>,
    fail_publish: Arc<AtomicBool>,
}

/// Test-side view of a [`MockMqttClient`] that stays usable after the client
/// has been moved into a bus.
#[cfg(test)]
#[derive(Clone)]
pub struct MockHandle {
    log: Arc<std::sync::Mutex<MockLog>>,
    inbound_tx: mpsc::UnboundedSender<MqttMessage>,
    connected: Arc<AtomicBool>,
    fail_publish: Arc<AtomicBool>,
}

#[cfg(test)]
impl MockMqttClient {
    /// Create a new mock MQTT client
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            log: Arc::default(),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            connected: Arc::new(AtomicBool::new(false)),
            fail_publish: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            log: self.log.clone(),
            inbound_tx: self.inbound_tx.clone(),
            connected: self.connected.clone(),
            fail_publish: self.fail_publish.clone(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&mut self) -> Result<MessageStream, ClientError> {
        let rx = self.inbound_rx.take().ok_or(ClientError::NotConnected)?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ClientError> {
        self.log
            .lock()
            .unwrap()
            .subscriptions
            .push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), ClientError> {
        self.log
            .lock()
            .unwrap()
            .unsubscriptions
            .push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(ClientError::Rejected(format!("publish to {}", topic)));
        }
        self.log
            .lock()
            .unwrap()
            .published
            .push((topic.to_string(), payload.to_vec(), qos, retain));
        Ok(())
    }
}

#[cfg(test)]
impl MockHandle {
    /// Queue a message as if the broker had delivered it
    pub fn inject(&self, topic: &str, payload: &str) {
        self.inbound_tx
            .send(MqttMessage::new(topic, payload.as_bytes()))
            .unwrap();
    }

    /// Published (topic, payload) pairs in order
    pub fn published(&self) -> Vec<(String, String)> {
        self.log
            .lock()
            .unwrap()
            .published
            .iter()
            .map(|(t, p, _, _)| (t.clone(), String::from_utf8_lossy(p).into_owned()))
            .collect()
    }

    pub fn published_with_qos(&self) -> Vec<(String, QoS)> {
        self.log
            .lock()
            .unwrap()
            .published
            .iter()
            .map(|(t, _, q, _)| (t.clone(), *q))
            .collect()
    }

    pub fn clear_published(&self) {
        self.log.lock().unwrap().published.clear();
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn subscription_qos(&self, topic: &str) -> Option<QoS> {
        self.log
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .rev()
            .find(|(t, _)| t == topic)
            .map(|(_, q)| *q)
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.log.lock().unwrap().unsubscriptions.clone()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}
