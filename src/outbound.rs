//! Outbound Publisher
//!
//! Publishes one flattened snapshot per registry entry to the control
//! topic. Publishes are paced by a minimum interval and a failed item never
//! stops the rest of the cycle.

use crate::ingestor::ConnectionManager;
use crate::observability::metrics;
use crate::protocol::timestamps::{format_timestamp, now_utc};
use crate::protocol::{DeviceRegistryEntry, PublishAttempt, PublishOutcome};
use crate::storage::DeviceRegistry;
use crate::transport::pacing::MinIntervalPacer;
use crate::transport::{Transport, TransportError};
use chrono::{DateTime, Utc};
use rumqttc::v5::mqttbytes::QoS;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Field carrying the snapshot's publish time
pub const PUBLISH_TIME_FIELD: &str = "publish_time";

/// Build the control-topic payload for one entry: strings trimmed, nulls
/// and absent fields omitted, `publish_time` always present.
pub fn build_snapshot_payload(
    entry: &DeviceRegistryEntry,
    publish_time: &DateTime<Utc>,
) -> Map<String, Value> {
    let mut payload = Map::new();
    if let Ok(Value::Object(fields)) = serde_json::to_value(entry) {
        for (key, value) in fields {
            match value {
                Value::Null => {}
                Value::String(text) => {
                    payload.insert(key, Value::String(text.trim().to_string()));
                }
                other => {
                    payload.insert(key, other);
                }
            }
        }
    }
    payload.insert(
        PUBLISH_TIME_FIELD.to_string(),
        Value::String(format_timestamp(publish_time)),
    );
    payload
}

pub struct OutboundPublisher<T: Transport> {
    manager: Arc<ConnectionManager<T>>,
    control_topic: String,
    pacer: MinIntervalPacer,
}

impl<T: Transport> OutboundPublisher<T> {
    pub fn new(
        manager: Arc<ConnectionManager<T>>,
        control_topic: impl Into<String>,
        publish_spacing: Duration,
    ) -> Self {
        Self {
            manager,
            control_topic: control_topic.into(),
            pacer: MinIntervalPacer::new(publish_spacing),
        }
    }

    pub fn control_topic(&self) -> &str {
        &self.control_topic
    }

    /// Publish one snapshot per entry, in order. The result always has one
    /// attempt per entry.
    pub async fn publish_snapshot(&self, entries: &[DeviceRegistryEntry]) -> Vec<PublishAttempt> {
        let mut attempts = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload = build_snapshot_payload(entry, &now_utc());
            let outcome = match self.publish_one(&payload).await {
                Ok(()) => PublishOutcome::Success,
                Err(e) => {
                    warn!(
                        topic = %self.control_topic,
                        device_id = entry.device_id().as_deref().unwrap_or("<unknown>"),
                        "Snapshot publish failed: {}",
                        e
                    );
                    PublishOutcome::Failure(e.to_string())
                }
            };
            attempts.push(PublishAttempt {
                target: self.control_topic.clone(),
                device_id: entry.device_id(),
                payload,
                outcome,
            });
        }
        attempts
    }

    async fn publish_one(&self, payload: &Map<String, Value>) -> Result<(), TransportError> {
        // Not connected: record the failure without a broker call or a wait.
        if !self.manager.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let bytes = serde_json::to_vec(payload).map_err(|e| TransportError::PublishFailed {
            topic: self.control_topic.clone(),
            reason: e.to_string(),
        })?;
        self.pacer.wait().await;
        self.manager
            .publish(&self.control_topic, bytes, QoS::AtLeastOnce, false)
            .await
    }

    /// Read the registry and publish a snapshot of every entry.
    /// Returns the attempts; a registry failure yields none.
    pub async fn publish_cycle(&self, registry: &DeviceRegistry) -> Vec<PublishAttempt> {
        let entries = match registry.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Publish cycle skipped, device registry unavailable: {}", e);
                return Vec::new();
            }
        };
        if entries.is_empty() {
            debug!("Publish cycle skipped, registry is empty");
            return Vec::new();
        }

        let attempts = self.publish_snapshot(&entries).await;
        let successes = attempts.iter().filter(|a| a.succeeded()).count();
        let failures = attempts.len() - successes;
        metrics().publish_cycle_completed(successes, failures);
        info!(
            topic = %self.control_topic,
            published = successes,
            failed = failures,
            "Registry snapshot published"
        );
        attempts
    }
}
