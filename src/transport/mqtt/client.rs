//! Impure I/O operations for the MQTT session
//!
//! `MqttSession` owns the rumqttc client and a dedicated poll task per
//! connection. Every connect builds a fresh client and event loop; the poll
//! task reports the ConnAck (or the failure before it) to the waiting
//! `connect` call and afterwards pushes `TransportEvent`s onto the shared
//! channel. Reconnect policy lives above this layer.

use super::connection::{configure_mqtt_options, SessionSettings};
use super::message_handler::{EventForwarder, EventRoute, MessageHandler};
use crate::transport::pacing::MinIntervalPacer;
use crate::transport::{Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Capacity of rumqttc's internal request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;
/// How long a closing poll task may take to wind down before it is aborted
const POLL_TASK_STOP_TIMEOUT: Duration = Duration::from_secs(2);

type ConnAckSender = oneshot::Sender<Result<(), TransportError>>;

/// MQTT v5 broker session
pub struct MqttSession {
    settings: SessionSettings,
    event_tx: mpsc::Sender<TransportEvent>,
    client: Mutex<Option<AsyncClient>>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    /// Filters subscribed on the current connection
    active: Mutex<HashSet<String>>,
    pacer: MinIntervalPacer,
}

impl MqttSession {
    pub fn new(settings: SessionSettings, event_tx: mpsc::Sender<TransportEvent>) -> Self {
        let pacer = MinIntervalPacer::new(settings.call_spacing);
        Self {
            settings,
            event_tx,
            client: Mutex::new(None),
            poll_handle: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(HashSet::new()),
            pacer,
        }
    }

    /// Create a session together with the receiving end of its event channel
    pub fn with_channel(
        settings: SessionSettings,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        (Self::new(settings, event_tx), event_rx)
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Filters subscribed on the current connection
    pub async fn active_filters(&self) -> HashSet<String> {
        self.active.lock().await.clone()
    }

    async fn current_client(&self) -> Result<AsyncClient, TransportError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    /// Stop the current poll task, letting it finish on its own first
    async fn stop_poll_task(&self, grace: Duration) {
        let handle = self.poll_handle.lock().await.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                debug!("Poll task did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    /// Drive one connection's event loop until it ends
    async fn run_event_loop(
        mut event_loop: EventLoop,
        mut connack_tx: Option<ConnAckSender>,
        forwarder: EventForwarder,
        connected: Arc<AtomicBool>,
        closing: Arc<AtomicBool>,
    ) {
        loop {
            match event_loop.poll().await {
                Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => {
                        connected.store(true, Ordering::SeqCst);
                        if let Some(tx) = connack_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                        forwarder.forward(TransportEvent::Connected).await;
                    }
                    EventRoute::MessageReceived { topic, payload } => {
                        trace!(target: "mqtt_transport", %topic, bytes = payload.len(), "Message received");
                        forwarder.forward_message(topic, payload).await;
                    }
                    EventRoute::Disconnected(reason) => {
                        connected.store(false, Ordering::SeqCst);
                        if !closing.load(Ordering::SeqCst) {
                            warn!("Broker sent DISCONNECT: {}", reason);
                            forwarder
                                .forward(TransportEvent::Disconnected {
                                    reason: format!("broker disconnect: {reason}"),
                                })
                                .await;
                        }
                        break;
                    }
                    EventRoute::SubscriptionAcknowledged { packet_id, detail } => {
                        debug!(target: "mqtt_transport", packet_id, "Subscription acknowledged: {}", detail);
                    }
                    EventRoute::InfrastructureEvent(event_str) => {
                        trace!(target: "mqtt_transport", "MQTT event: {}", event_str);
                    }
                    EventRoute::OutgoingEvent => {}
                },
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    if let Some(tx) = connack_tx.take() {
                        let _ = tx.send(Err(MessageHandler::classify_connection_error(&e)));
                        break;
                    }
                    if !closing.load(Ordering::SeqCst) {
                        error!("MQTT event loop error: {}", e);
                        forwarder
                            .forward(TransportEvent::Disconnected {
                                reason: e.to_string(),
                            })
                            .await;
                    }
                    break;
                }
            }
        }
        debug!(target: "mqtt_transport", "MQTT poll task stopped");
    }
}

#[async_trait]
impl Transport for MqttSession {
    async fn connect(&self) -> Result<(), TransportError> {
        // Retire any previous connection; its poll task must not report.
        self.closing.store(true, Ordering::SeqCst);
        if let Some(old) = self.client.lock().await.take() {
            let _ = old.try_disconnect();
        }
        self.stop_poll_task(Duration::ZERO).await;
        self.connected.store(false, Ordering::SeqCst);
        self.active.lock().await.clear();
        self.pacer.reset().await;

        let mqtt_options = configure_mqtt_options(&self.settings)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let forwarder = EventForwarder::new(self.event_tx.clone(), self.generation.clone(), generation);
        let (connack_tx, connack_rx) = oneshot::channel();

        self.closing.store(false, Ordering::SeqCst);
        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            Some(connack_tx),
            forwarder,
            self.connected.clone(),
            self.closing.clone(),
        ));
        *self.poll_handle.lock().await = Some(handle);
        *self.client.lock().await = Some(client);

        info!(
            host = %self.settings.host,
            port = self.settings.port,
            tls = self.settings.tls.is_some(),
            generation,
            "Connecting to MQTT broker"
        );

        let outcome = match tokio::time::timeout(self.settings.connack_timeout, connack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Unreachable(
                "event loop stopped before acknowledgement".to_string(),
            )),
            Err(_) => Err(TransportError::ConnAckTimeout(self.settings.connack_timeout)),
        };

        if outcome.is_err() {
            self.closing.store(true, Ordering::SeqCst);
            self.client.lock().await.take();
            self.stop_poll_task(Duration::ZERO).await;
            self.connected.store(false, Ordering::SeqCst);
        }
        outcome
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            if self.connected.load(Ordering::SeqCst) {
                if let Err(e) = client.disconnect().await {
                    debug!("Disconnect request not delivered: {}", e);
                }
            }
        }
        self.stop_poll_task(POLL_TASK_STOP_TIMEOUT).await;
        self.connected.store(false, Ordering::SeqCst);
        self.active.lock().await.clear();
        info!("MQTT session closed");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        // Held across the paced call: subscribes are strictly serialized.
        let mut active = self.active.lock().await;
        if active.contains(topic) {
            debug!(target: "mqtt_transport", %topic, "Already subscribed");
            return Ok(());
        }
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let client = self.current_client().await?;

        self.pacer.wait().await;
        client
            .subscribe(topic, qos)
            .await
            .map_err(|e| TransportError::SubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        active.insert(topic.to_string());
        debug!(target: "mqtt_transport", %topic, ?qos, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut active = self.active.lock().await;
        active.remove(topic);
        if !self.is_connected() {
            return Ok(());
        }
        let client = self.current_client().await?;
        self.pacer.wait().await;
        if let Err(e) = client.unsubscribe(topic).await {
            warn!(%topic, "Unsubscribe not delivered: {}", e);
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let client = self.current_client().await?;
        self.pacer.wait().await;
        client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
