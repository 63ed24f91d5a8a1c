//! Message Classifier & Normalizer
//!
//! Maps one inbound message (topic + raw payload) to a `ClassifiedRecord`
//! or a `DropReason`. Pure apart from logging: no storage, no broker.
//!
//! Stream precedence, first match wins, case-insensitive substring match
//! over the canonical JSON rendering of the payload:
//!
//! 1. telemetry vocabulary
//! 2. alert vocabulary
//! 3. status vocabulary
//! 4. the same vocabularies (plus `telemetry`) over the topic string
//! 5. `Raw`

use crate::config::DeviceIdSource;
use crate::protocol::timestamps::parse_payload_timestamp;
use crate::protocol::topics::{extract_device_id, normalize_device_id};
use crate::protocol::{ClassifiedRecord, DropReason, StreamKind, TELEMETRY_ARRAY_FIELDS};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

pub const TELEMETRY_KEYWORDS: [&str; 7] = [
    "voltage",
    "current",
    "soc",
    "temperature",
    "power",
    "capacity",
    "energy",
];

pub const ALERT_KEYWORDS: [&str; 6] = ["alert", "warning", "error", "fault", "alarm", "critical"];

pub const STATUS_KEYWORDS: [&str; 7] = [
    "status",
    "state",
    "mode",
    "online",
    "offline",
    "connected",
    "disconnected",
];

/// Field holding the text of a payload that is not structured data
pub const RAW_TEXT_FIELD: &str = "raw_text";

/// Payload fields that may carry the device id
const PAYLOAD_DEVICE_FIELDS: [&str; 2] = ["device_id", "packsn"];

/// Payload fields that may carry the creation time
const PAYLOAD_TIME_FIELDS: [&str; 2] = ["created_at", "timestamp"];

#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    device_id_source: DeviceIdSource,
}

impl Classifier {
    pub fn new(device_id_source: DeviceIdSource) -> Self {
        Self { device_id_source }
    }

    /// Classify a message received at `received_at`
    pub fn classify(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<ClassifiedRecord, DropReason> {
        let text =
            std::str::from_utf8(payload).map_err(|e| DropReason::DecodeError(e.to_string()))?;

        let (fields, structured) = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => (map, true),
            Ok(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                (map, true)
            }
            Err(_) => {
                let mut map = Map::new();
                map.insert(RAW_TEXT_FIELD.to_string(), Value::String(text.to_string()));
                (map, false)
            }
        };

        let device_id = self
            .device_id(topic, structured.then_some(&fields))
            .ok_or(DropReason::EmptyDeviceId)?;

        let stream_kind = if structured {
            classify_stream(&fields, topic)
        } else {
            StreamKind::Raw
        };

        if stream_kind == StreamKind::Telemetry {
            check_telemetry_fields(&fields, &device_id)?;
        }

        let occurred_at = PAYLOAD_TIME_FIELDS
            .iter()
            .filter_map(|field| fields.get(*field))
            .find_map(parse_payload_timestamp)
            .unwrap_or(received_at);

        Ok(ClassifiedRecord {
            stream_kind,
            device_id,
            topic: topic.to_string(),
            fields,
            occurred_at,
        })
    }

    fn device_id(&self, topic: &str, fields: Option<&Map<String, Value>>) -> Option<String> {
        if self.device_id_source == DeviceIdSource::PayloadThenTopic {
            let from_payload = fields.and_then(|fields| {
                PAYLOAD_DEVICE_FIELDS
                    .iter()
                    .filter_map(|key| fields.get(*key).and_then(Value::as_str))
                    .find_map(normalize_device_id)
            });
            if from_payload.is_some() {
                return from_payload;
            }
        }
        extract_device_id(topic)
    }
}

/// Stream kind for a structured payload on a topic
pub fn classify_stream(fields: &Map<String, Value>, topic: &str) -> StreamKind {
    let rendered = serde_json::to_string(fields)
        .unwrap_or_default()
        .to_lowercase();
    if let Some(kind) = match_vocabulary(&rendered, false) {
        return kind;
    }
    match_vocabulary(&topic.to_lowercase(), true).unwrap_or(StreamKind::Raw)
}

fn match_vocabulary(haystack: &str, include_stream_names: bool) -> Option<StreamKind> {
    let contains_any = |words: &[&str]| words.iter().any(|word| haystack.contains(word));

    if contains_any(&TELEMETRY_KEYWORDS) || (include_stream_names && haystack.contains("telemetry"))
    {
        Some(StreamKind::Telemetry)
    } else if contains_any(&ALERT_KEYWORDS) {
        Some(StreamKind::Alert)
    } else if contains_any(&STATUS_KEYWORDS) {
        Some(StreamKind::Status)
    } else {
        None
    }
}

fn check_telemetry_fields(fields: &Map<String, Value>, device_id: &str) -> Result<(), DropReason> {
    let mut lengths = Vec::with_capacity(TELEMETRY_ARRAY_FIELDS.len());
    for field in TELEMETRY_ARRAY_FIELDS {
        match fields.get(field) {
            None | Some(Value::Null) => {
                return Err(DropReason::MissingRequiredField(field.to_string()))
            }
            Some(Value::Array(values)) => lengths.push(values.len()),
            Some(_) => return Err(DropReason::InvalidField(field.to_string())),
        }
    }
    if lengths.windows(2).any(|pair| pair[0] != pair[1]) {
        warn!(device_id, ?lengths, "Per-cell arrays differ in length");
    }
    Ok(())
}
