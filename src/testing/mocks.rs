//! Mock implementations for testing
//!
//! Provides mock Transport, Storage and DeviceSource implementations so the
//! connection manager, pipeline and publisher can be exercised without a
//! broker or a storage service.

use crate::protocol::topics::normalize_device_id;
use crate::protocol::InboundMessage;
use crate::storage::{Storage, StorageError, Table};
use crate::subscription::DeviceSource;
use crate::transport::{Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A publish recorded by `MockTransport`
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Mock transport for testing
///
/// Only real broker round-trips are recorded in `subscribe_calls`; a
/// subscribe for a filter already active on the current session is a no-op.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    connect_attempts: AtomicU32,
    connect_failures_remaining: AtomicU32,
    sessions_to_drop: AtomicU32,
    fail_publishes: AtomicBool,
    failing_topics: Mutex<HashSet<String>>,
    session_active: Mutex<HashSet<String>>,
    subscribe_calls: Mutex<Vec<String>>,
    unsubscribe_calls: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    event_tx: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport together with its event channel
    pub fn with_channel(capacity: usize) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let transport = Self::new();
        *lock(&transport.event_tx) = Some(tx);
        (transport, rx)
    }

    /// Make the next `count` connect calls fail as unreachable
    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures_remaining
            .store(count, Ordering::SeqCst);
    }

    /// Let the next `count` connects succeed but lose the session right
    /// after ConnAck, before the caller gets to subscribe
    pub fn drop_session_after_next_connects(&self, count: u32) {
        self.sessions_to_drop.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Make subscribes to one filter fail
    pub fn fail_subscribe(&self, topic: &str) {
        lock(&self.failing_topics).insert(topic.to_string());
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        lock(&self.subscribe_calls).clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        lock(&self.unsubscribe_calls).clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    /// Publishes to one topic, in order
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        lock(&self.published)
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    /// Filters subscribed on the current session
    pub fn session_filters(&self) -> BTreeSet<String> {
        lock(&self.session_active).iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        lock(&self.subscribe_calls).clear();
        lock(&self.unsubscribe_calls).clear();
        lock(&self.published).clear();
    }

    fn sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        lock(&self.event_tx).clone()
    }

    /// Drop the session as a broker or network failure would
    pub async fn simulate_connection_lost(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.session_active).clear();
        if let Some(tx) = self.sender() {
            let _ = tx
                .send(TransportEvent::Disconnected {
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Deliver an inbound message as the broker would
    pub async fn deliver(&self, topic: &str, payload: impl Into<bytes::Bytes>) {
        if let Some(tx) = self.sender() {
            let _ = tx
                .send(TransportEvent::MessageArrived(InboundMessage::new(
                    topic, payload,
                )))
                .await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.connect_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Unreachable(
                "mock broker refused connection".to_string(),
            ));
        }
        lock(&self.session_active).clear();
        self.connected.store(true, Ordering::SeqCst);
        if let Some(tx) = self.sender() {
            let _ = tx.send(TransportEvent::Connected).await;
        }
        let to_drop = self.sessions_to_drop.load(Ordering::SeqCst);
        if to_drop > 0 {
            self.sessions_to_drop.store(to_drop - 1, Ordering::SeqCst);
            self.simulate_connection_lost("mock session dropped after connack")
                .await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.session_active).clear();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if lock(&self.session_active).contains(topic) {
            return Ok(());
        }
        if lock(&self.failing_topics).contains(topic) {
            return Err(TransportError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "mock subscribe failure".to_string(),
            });
        }
        lock(&self.subscribe_calls).push(topic.to_string());
        lock(&self.session_active).insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        lock(&self.unsubscribe_calls).push(topic.to_string());
        lock(&self.session_active).remove(topic);
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
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: "mock publish failure".to_string(),
            });
        }
        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// In-memory storage for testing
#[derive(Debug, Default)]
pub struct MockStorage {
    tables: Mutex<HashMap<Table, Vec<Value>>>,
    failing: AtomicBool,
    insert_attempts: AtomicU32,
    panic_device: Mutex<Option<String>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a table's rows
    pub fn seed(&self, table: Table, rows: Vec<Value>) {
        lock(&self.tables).insert(table, rows);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make inserts for one device panic, as a broken storage driver would
    pub fn panic_on_device(&self, device_id: &str) {
        *lock(&self.panic_device) = Some(device_id.to_string());
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        lock(&self.tables).get(&table).cloned().unwrap_or_default()
    }

    /// Rows across all tables, excluding the registry
    pub fn inserted_count(&self) -> usize {
        lock(&self.tables)
            .iter()
            .filter(|(table, _)| **table != Table::DeviceRegistry)
            .map(|(_, rows)| rows.len())
            .sum()
    }

    pub fn insert_attempts(&self) -> u32 {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Network("mock storage unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MockStorage {
    async fn insert(&self, table: Table, row: &Map<String, Value>) -> Result<(), StorageError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if let Some(device_id) = lock(&self.panic_device).clone() {
            let row_device = row
                .get("packsn")
                .or_else(|| row.get("device_id"))
                .and_then(Value::as_str);
            if row_device == Some(device_id.as_str()) {
                panic!("mock storage panicked on insert for {device_id}");
            }
        }
        lock(&self.tables)
            .entry(table)
            .or_default()
            .push(Value::Object(row.clone()));
        Ok(())
    }

    async fn select_latest(&self, table: Table, limit: usize) -> Result<Vec<Value>, StorageError> {
        self.check_available()?;
        Ok(self.rows(table).into_iter().rev().take(limit).collect())
    }

    async fn select_all(&self, table: Table) -> Result<Vec<Value>, StorageError> {
        self.check_available()?;
        Ok(self.rows(table))
    }

    async fn select_by_key(
        &self,
        table: Table,
        device_id: &str,
    ) -> Result<Option<Value>, StorageError> {
        self.check_available()?;
        let key = match table {
            Table::Telemetry | Table::DeviceRegistry => "packsn",
            Table::Alerts | Table::DeviceStatus | Table::RawMessages => "device_id",
        };
        Ok(self.rows(table).into_iter().find(|row| {
            row.get(key)
                .and_then(Value::as_str)
                .is_some_and(|value| value.trim() == device_id)
        }))
    }
}

/// Device source with a settable id list
#[derive(Debug, Default)]
pub struct StaticDeviceSource {
    ids: Mutex<BTreeSet<String>>,
    unavailable: AtomicBool,
}

impl StaticDeviceSource {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let source = Self::default();
        source.set_ids(ids);
        source
    }

    pub fn set_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        *lock(&self.ids) = ids
            .into_iter()
            .filter_map(|id| normalize_device_id(id.as_ref()))
            .collect();
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceSource for StaticDeviceSource {
    async fn device_ids(&self) -> Result<BTreeSet<String>, StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Network("mock registry unavailable".to_string()));
        }
        Ok(lock(&self.ids).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_transport_subscribe_is_idempotent_per_session() {
        let transport = MockTransport::new();
        transport.connect().await.unwrap();

        transport.subscribe("a/b", QoS::AtLeastOnce).await.unwrap();
        transport.subscribe("a/b", QoS::AtLeastOnce).await.unwrap();

        assert_eq!(transport.subscribe_calls(), vec!["a/b".to_string()]);

        transport.simulate_connection_lost("test").await;
        transport.connect().await.unwrap();
        transport.subscribe("a/b", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(transport.subscribe_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_transport_connect_failures() {
        let transport = MockTransport::new();
        transport.fail_next_connects(2);

        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_mock_storage_latest_first() {
        let storage = MockStorage::new();
        for n in 0..3 {
            let row = json!({"packsn": format!("PACK{n}")});
            storage
                .insert(Table::Telemetry, row.as_object().unwrap())
                .await
                .unwrap();
        }

        let latest = storage.select_latest(Table::Telemetry, 2).await.unwrap();

        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0]["packsn"], json!("PACK2"));
    }
}
