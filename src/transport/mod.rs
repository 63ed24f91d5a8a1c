//! Transport layer for broker communication
//!
//! The `Transport` trait is the narrow contract the connection state machine
//! and outbound publisher drive. Inbound traffic and connection changes flow
//! the other way as `TransportEvent`s on a single ordered channel.

use crate::protocol::InboundMessage;
use rumqttc::v5::mqttbytes::QoS;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;
pub mod pacing;

/// Events pushed by a transport session, in delivery order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The broker acknowledged a connect
    Connected,
    /// The session ended without being asked to
    Disconnected { reason: String },
    /// An application message arrived
    MessageArrived(InboundMessage),
}

/// Transport failures as seen by callers
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("broker rejected credentials: {0}")]
    AuthRejected(String),
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
    #[error("broker did not acknowledge connect within {0:?}")]
    ConnAckTimeout(Duration),
    #[error("not connected")]
    NotConnected,
    #[error("subscribe to '{topic}' failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },
    #[error("publish to '{topic}' failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("invalid session options: {0}")]
    InvalidOptions(String),
}

/// Transport trait for broker sessions
///
/// Implementations are internally synchronized so a single instance can be
/// shared between the connection state machine, the health monitor and the
/// outbound publisher.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Establish a new session and wait for the broker's acknowledgement
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the session; no `Disconnected` event is emitted for it
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Subscribe to a topic filter. Re-subscribing an active filter on the
    /// current session is a no-op.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Best-effort unsubscribe; the filter leaves the session's active set
    /// whatever the broker answers
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Publish a payload; fails with `NotConnected` when the session is down
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Check if the session is currently acknowledged and alive
    fn is_connected(&self) -> bool;
}

/// Type alias for the MQTT transport
pub type MqttTransport = mqtt::MqttSession;

/// Map a configured QoS level onto the broker enum
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}
