//! BMS Ingestor - Rust Implementation
//!
//! An MQTT telemetry ingestion service for battery management systems.
//!
//! # Overview
//!
//! The ingestor keeps a broker session subscribed to every device listed in
//! an external registry, classifies each inbound message into a telemetry,
//! alert, status or raw record and writes it to a PostgREST storage service.
//! It also publishes registry snapshots to a control topic on a timer.
//!
//! - Protocol message types, topic rules and the UTC timestamp policy
//! - MQTT v5 transport session with TLS and minimum-interval pacing
//! - Subscription registry reconciled against the device registry
//! - Connection state machine with capped reconnect bursts
//! - Bounded, topic-sharded ingest pipeline
//!
//! # Quick Start
//!
//! ```rust
//! use bms_ingestor::processing::Classifier;
//! use bms_ingestor::protocol::StreamKind;
//! use chrono::Utc;
//!
//! let payload = br#"{"cell_voltages":[3.7,3.71],"cell_socs":[80,81],"cell_temperatures":[25,26]}"#;
//! let record = Classifier::default()
//!     .classify("bms/telemetry/PACK007 ", payload, Utc::now())
//!     .unwrap();
//!
//! assert_eq!(record.stream_kind, StreamKind::Telemetry);
//! assert_eq!(record.device_id, "PACK007");
//! ```

pub mod config;
pub mod error;
pub mod ingestor;
pub mod observability;
pub mod outbound;
pub mod processing;
pub mod protocol;
pub mod storage;
pub mod subscription;
pub mod testing;
pub mod transport;

pub use config::*;
pub use error::{IngestError, IngestResult};
pub use ingestor::{ConnectionManager, ConnectionState, Ingestor};
pub use outbound::OutboundPublisher;
pub use protocol::*;
pub use storage::{Storage, StorageError, Table};
pub use transport::mqtt::MqttSession;
pub use transport::{Transport, TransportError, TransportEvent};
