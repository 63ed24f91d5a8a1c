//! Core message types flowing through the ingestor
//!
//! Inbound: `InboundMessage` (as delivered by the broker) becomes either a
//! `ClassifiedRecord` or a `DropReason`. Outbound: `DeviceRegistryEntry`
//! snapshots become `PublishAttempt`s.

use super::timestamps::format_timestamp;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Per-cell arrays every telemetry payload must carry
pub const TELEMETRY_ARRAY_FIELDS: [&str; 3] = ["cell_voltages", "cell_socs", "cell_temperatures"];

/// Device column used in telemetry rows
pub const TELEMETRY_DEVICE_COLUMN: &str = "packsn";

/// A message as received from the broker, before classification
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub raw_payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, raw_payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            raw_payload: raw_payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Logical data stream a record is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Telemetry,
    Alert,
    Status,
    Raw,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Telemetry => "telemetry",
            StreamKind::Alert => "alert",
            StreamKind::Status => "status",
            StreamKind::Raw => "raw",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized record ready for storage
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRecord {
    pub stream_kind: StreamKind,
    pub device_id: String,
    pub topic: String,
    pub fields: Map<String, Value>,
    pub occurred_at: DateTime<Utc>,
}

impl ClassifiedRecord {
    /// Build the storage row for this record.
    ///
    /// Telemetry rows carry only the device column, the three per-cell
    /// arrays and `created_at`. Other streams carry every payload field
    /// plus `device_id`, `topic` and `created_at`.
    pub fn to_row(&self) -> Map<String, Value> {
        let created_at = Value::String(format_timestamp(&self.occurred_at));
        match self.stream_kind {
            StreamKind::Telemetry => {
                let mut row = Map::new();
                row.insert(
                    TELEMETRY_DEVICE_COLUMN.to_string(),
                    Value::String(self.device_id.clone()),
                );
                for field in TELEMETRY_ARRAY_FIELDS {
                    if let Some(value) = self.fields.get(field) {
                        row.insert(field.to_string(), value.clone());
                    }
                }
                row.insert("created_at".to_string(), created_at);
                row
            }
            StreamKind::Alert | StreamKind::Status | StreamKind::Raw => {
                let mut row = self.fields.clone();
                row.insert(
                    "device_id".to_string(),
                    Value::String(self.device_id.clone()),
                );
                row.insert("topic".to_string(), Value::String(self.topic.clone()));
                row.insert("created_at".to_string(), created_at);
                row
            }
        }
    }
}

/// Why an inbound message was not stored
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DropReason {
    #[error("payload is not valid UTF-8: {0}")]
    DecodeError(String),
    #[error("device id is empty after trimming")]
    EmptyDeviceId,
    #[error("telemetry payload missing required field '{0}'")]
    MissingRequiredField(String),
    #[error("telemetry field '{0}' is not an array")]
    InvalidField(String),
}

impl DropReason {
    /// Stable label used for drop counters
    pub fn label(&self) -> &'static str {
        match self {
            DropReason::DecodeError(_) => "decode_error",
            DropReason::EmptyDeviceId => "empty_device_id",
            DropReason::MissingRequiredField(_) => "missing_required_field",
            DropReason::InvalidField(_) => "invalid_field",
        }
    }
}

/// A device as listed in the external registry table. Read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistryEntry {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub packsn: Option<String>,
    #[serde(default)]
    pub bmssn: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub rated_capacity: Option<Value>,
    #[serde(default)]
    pub rated_voltage: Option<Value>,
    #[serde(default)]
    pub battery_type: Option<String>,
    #[serde(default)]
    pub number_of_cells: Option<Value>,
    #[serde(default)]
    pub number_of_temperature_sensors: Option<Value>,
    #[serde(default)]
    pub bms_hardware_version: Option<String>,
    #[serde(default)]
    pub bms_software_version: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl DeviceRegistryEntry {
    /// The entry's device id (trimmed serial), if it has a usable one
    pub fn device_id(&self) -> Option<String> {
        self.packsn
            .as_deref()
            .and_then(super::topics::normalize_device_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Success,
    Failure(String),
}

/// Result of publishing one snapshot payload
#[derive(Debug, Clone, PartialEq)]
pub struct PublishAttempt {
    pub target: String,
    pub device_id: Option<String>,
    pub payload: Map<String, Value>,
    pub outcome: PublishOutcome,
}

impl PublishAttempt {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, PublishOutcome::Success)
    }
}
