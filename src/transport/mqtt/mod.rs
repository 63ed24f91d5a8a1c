//! MQTT v5 transport session for the ingestor
//!
//! This module separates pure functions from I/O operations for better
//! testability:
//!
//! - [`connection`] - Pure session settings and option construction
//! - [`message_handler`] - Pure event routing and connect-error classification
//! - [`tls`] - TLS client configuration, built once at startup
//! - [`client`] - Impure I/O: the `MqttSession` and its poll task
//!
//! # Usage
//!
//! ```rust,no_run
//! use bms_ingestor::transport::mqtt::{MqttSession, SessionSettings};
//! use bms_ingestor::transport::Transport;
//! use rumqttc::v5::mqttbytes::QoS;
//!
//! # tokio_test::block_on(async {
//! let settings = SessionSettings::plain("localhost", 1883);
//! let (session, mut events) = MqttSession::with_channel(settings, 256);
//!
//! session.connect().await?;
//! session.subscribe("bms/telemetry/#", QoS::AtLeastOnce).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod tls;

// Re-export public types for convenience
pub use client::MqttSession;
pub use connection::{
    configure_mqtt_options, Credentials, SessionSettings, STATUS_OFFLINE, STATUS_ONLINE,
};
pub use message_handler::{EventForwarder, EventRoute, MessageHandler};
pub use tls::{build_client_config, TlsSetupError};
