//! Pure routing of rumqttc events and connect-error classification
//!
//! The poll task owned by `MqttSession` turns every rumqttc event into an
//! `EventRoute` here and forwards what matters as `TransportEvent`s.

use crate::protocol::InboundMessage;
use crate::transport::{TransportError, TransportEvent};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::{ConnectionError, Event};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    detail: format!("{:?}", suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Classify a rumqttc connection error into the transport taxonomy
    pub fn classify_connection_error(error: &ConnectionError) -> TransportError {
        match error {
            ConnectionError::ConnectionRefused(code) => match code {
                ConnectReturnCode::BadUserNamePassword
                | ConnectReturnCode::NotAuthorized
                | ConnectReturnCode::BadAuthenticationMethod
                | ConnectReturnCode::Banned => TransportError::AuthRejected(format!("{code:?}")),
                other => {
                    TransportError::Unreachable(format!("broker refused connection: {other:?}"))
                }
            },
            other => {
                let message = other.to_string();
                if Self::is_tls_failure(&message) {
                    TransportError::TlsHandshakeFailed(message)
                } else {
                    TransportError::Unreachable(message)
                }
            }
        }
    }

    /// Heuristic over error text; rumqttc wraps TLS failures in several layers
    pub fn is_tls_failure(message: &str) -> bool {
        let lowered = message.to_ascii_lowercase();
        ["tls", "certificate", "handshake", "x509"]
            .iter()
            .any(|needle| lowered.contains(needle))
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// Broker sent DISCONNECT
    Disconnected(String),
    SubscriptionAcknowledged { packet_id: u16, detail: String },
    /// Infrastructure event (PingResp, PubAck, ...)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Forwards events from one session's poll task onto the shared channel.
///
/// Each session is stamped with a generation; once a newer session exists
/// the older poll task's events are discarded.
pub struct EventForwarder {
    sender: mpsc::Sender<TransportEvent>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
}

impl EventForwarder {
    pub fn new(
        sender: mpsc::Sender<TransportEvent>,
        current_generation: Arc<AtomicU64>,
        generation: u64,
    ) -> Self {
        Self {
            sender,
            current_generation,
            generation,
        }
    }

    pub fn is_current(&self) -> bool {
        self.current_generation.load(Ordering::SeqCst) == self.generation
    }

    /// Forward an event. Waits for channel capacity, which stalls the poll
    /// loop (and so the socket) when consumers fall behind.
    pub async fn forward(&self, event: TransportEvent) -> bool {
        if !self.is_current() {
            debug!(generation = self.generation, "Discarding event from superseded session");
            return false;
        }
        match self.sender.send(event).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Transport event channel closed, event lost: {:?}", e.0);
                false
            }
        }
    }

    pub async fn forward_message(&self, topic: String, payload: Bytes) -> bool {
        self.forward(TransportEvent::MessageArrived(InboundMessage::new(
            topic, payload,
        )))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, Disconnect, DisconnectReasonCode, Publish};
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_route_mqtt_event() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected(_)
        ));

        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("bms/telemetry/PACK001"),
            pkid: 1,
            payload: Bytes::from_static(b"{\"cell_voltages\":[3.7]}"),
            properties: None,
        }));

        if let EventRoute::MessageReceived { topic, payload } =
            MessageHandler::route_mqtt_event(&publish)
        {
            assert_eq!(topic, "bms/telemetry/PACK001");
            assert_eq!(&payload[..], b"{\"cell_voltages\":[3.7]}");
        } else {
            panic!("Expected MessageReceived route");
        }
    }

    #[test]
    fn test_classify_refused_credentials() {
        let error = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert!(matches!(
            MessageHandler::classify_connection_error(&error),
            TransportError::AuthRejected(_)
        ));

        let error = ConnectionError::ConnectionRefused(ConnectReturnCode::ServerUnavailable);
        assert!(matches!(
            MessageHandler::classify_connection_error(&error),
            TransportError::Unreachable(_)
        ));
    }

    #[test]
    fn test_classify_io_errors() {
        let error = ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(matches!(
            MessageHandler::classify_connection_error(&error),
            TransportError::Unreachable(_)
        ));
    }

    #[test]
    fn test_tls_failure_detection() {
        assert!(MessageHandler::is_tls_failure(
            "TLS: invalid peer certificate: UnknownIssuer"
        ));
        assert!(MessageHandler::is_tls_failure("Handshake failure"));
        assert!(!MessageHandler::is_tls_failure("connection refused"));
    }

    #[tokio::test]
    async fn test_forwarder_drops_stale_generation() {
        let (tx, mut rx) = mpsc::channel(4);
        let generation = Arc::new(AtomicU64::new(2));
        let stale = EventForwarder::new(tx.clone(), generation.clone(), 1);
        let current = EventForwarder::new(tx, generation, 2);

        assert!(!stale.forward(TransportEvent::Connected).await);
        assert!(current.forward(TransportEvent::Connected).await);

        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        assert!(rx.try_recv().is_err());
    }
}
