//! Outbound publisher tests
//!
//! Registry snapshots go to the control topic at QoS 1 without retain, one
//! payload per entry, with null fields left out.


use bms_ingestor::outbound::{OutboundPublisher, PUBLISH_TIME_FIELD};
use bms_ingestor::protocol::DeviceRegistryEntry;
use bms_ingestor::storage::{DeviceRegistry, Storage, Table};
use bms_ingestor::testing::{MockStorage, MockTransport};
use rumqttc::v5::mqttbytes::QoS;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_helpers::{manager_over, storage_with_devices, test_config};

fn registry_entry(packsn: &str, rated_capacity: Option<f64>) -> DeviceRegistryEntry {
    DeviceRegistryEntry {
        id: Some(json!(1)),
        packsn: Some(packsn.to_string()),
        bmssn: Some(format!("BMS-{packsn}")),
        manufacturer: Some("  Acme Energy  ".to_string()),
        device_type: Some("LFP pack".to_string()),
        rated_capacity: rated_capacity.map(|value| json!(value)),
        rated_voltage: Some(json!(51.2)),
        number_of_cells: Some(json!(16)),
        ..Default::default()
    }
}

async fn connected_publisher(
    spacing: Duration,
) -> (OutboundPublisher<MockTransport>, Arc<MockTransport>) {
    let config = test_config();
    let transport = Arc::new(MockTransport::new());
    let manager = manager_over(transport.clone(), Arc::new(MockStorage::new()), &config);
    manager.start().await.unwrap();
    transport.clear_history();
    (
        OutboundPublisher::new(manager, config.mqtt.control_topic.clone(), spacing),
        transport,
    )
}

#[tokio::test]
async fn test_three_entries_one_with_null_capacity() {
    // Arrange
    let (publisher, transport) = connected_publisher(Duration::from_millis(1)).await;
    let entries = vec![
        registry_entry("PACK001", Some(280.0)),
        registry_entry("PACK002", None),
        registry_entry("PACK003", Some(100.0)),
    ];

    // Act
    let attempts = publisher.publish_snapshot(&entries).await;

    // Assert
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|attempt| attempt.succeeded()));

    let published = transport.published_to(publisher.control_topic());
    assert_eq!(published.len(), 3);
    for message in &published {
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert!(!message.retain);
        let payload = message.json().unwrap();
        assert!(payload[PUBLISH_TIME_FIELD].is_string());
        assert_eq!(payload["manufacturer"], json!("Acme Energy"));
        assert!(payload.get("created_at").is_none());
    }
    assert!(published[1].json().unwrap().get("rated_capacity").is_none());
    assert_eq!(published[0].json().unwrap()["rated_capacity"], json!(280.0));
    assert_eq!(attempts[1].device_id.as_deref(), Some("PACK002"));
}

#[tokio::test]
async fn test_failed_item_does_not_abort_cycle() {
    let (publisher, transport) = connected_publisher(Duration::from_millis(1)).await;
    transport.set_fail_publishes(true);

    let attempts = publisher
        .publish_snapshot(&[registry_entry("PACK001", None), registry_entry("PACK002", None)])
        .await;

    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts.iter().filter(|a| !a.succeeded()).count(), 2);
}

#[tokio::test]
async fn test_publishes_are_spaced() {
    let (publisher, _transport) = connected_publisher(Duration::from_millis(40)).await;
    let entries: Vec<_> = (0..3)
        .map(|n| registry_entry(&format!("PACK00{n}"), None))
        .collect();
    let started = Instant::now();

    publisher.publish_snapshot(&entries).await;

    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn test_cycle_publishes_registry_contents() {
    let (publisher, transport) = connected_publisher(Duration::from_millis(1)).await;
    let storage = storage_with_devices(&["PACK001", "PACK002", "PACK003"]);
    storage.seed(
        Table::DeviceRegistry,
        vec![
            json!({"packsn": "PACK001", "rated_capacity": null}),
            json!({"packsn": "PACK002"}),
            json!({"packsn": "PACK003", "manufacturer": "Acme"}),
        ],
    );

    let attempts = publisher
        .publish_cycle(&DeviceRegistry::new(storage as Arc<dyn Storage>))
        .await;

    assert_eq!(attempts.len(), 3);
    assert_eq!(transport.published_to(publisher.control_topic()).len(), 3);
}
