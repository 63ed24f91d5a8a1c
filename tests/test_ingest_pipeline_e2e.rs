//! End-to-end ingest tests
//!
//! Messages go in through the transport event channel (or straight into the
//! pipeline) and come out as storage rows or counted drops.


use bms_ingestor::ingestor::Ingestor;
use bms_ingestor::processing::{process_message, Classifier, IngestPipeline, MessageOutcome};
use bms_ingestor::protocol::{DropReason, InboundMessage, StreamKind};
use bms_ingestor::storage::Table;
use bms_ingestor::testing::{MockStorage, MockTransport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{storage_with_devices, test_config, TELEMETRY_PAYLOAD};

#[tokio::test]
async fn test_complete_telemetry_is_stored_once() {
    // Arrange
    let storage = MockStorage::new();
    let message = InboundMessage::new("bms/telemetry/PACK007 ", TELEMETRY_PAYLOAD.as_bytes().to_vec());

    // Act
    let outcome = process_message(&Classifier::default(), &storage, &message).await;

    // Assert
    assert_eq!(outcome, MessageOutcome::Stored(StreamKind::Telemetry));
    assert_eq!(storage.insert_attempts(), 1);
    let rows = storage.rows(Table::Telemetry);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["packsn"], json!("PACK007"));
    assert_eq!(rows[0]["cell_voltages"], json!([3.7, 3.71]));
    assert_eq!(rows[0]["cell_socs"], json!([80, 81]));
    assert_eq!(rows[0]["cell_temperatures"], json!([25, 26]));
    assert!(rows[0]["created_at"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn test_incomplete_telemetry_is_dropped_without_insert() {
    let storage = MockStorage::new();
    let message = InboundMessage::new("bms/telemetry/PACK007", br#"{"voltage": 3.7}"#.to_vec());

    let outcome = process_message(&Classifier::default(), &storage, &message).await;

    assert!(matches!(
        outcome,
        MessageOutcome::Dropped(DropReason::MissingRequiredField(_))
    ));
    assert_eq!(storage.insert_attempts(), 0);
}

#[tokio::test]
async fn test_binary_payload_is_dropped_without_insert() {
    let storage = MockStorage::new();
    let message = InboundMessage::new("bms/telemetry/PACK007", vec![0xc3, 0x28, 0xa0, 0xa1]);

    let outcome = process_message(&Classifier::default(), &storage, &message).await;

    assert!(matches!(
        outcome,
        MessageOutcome::Dropped(DropReason::DecodeError(_))
    ));
    assert_eq!(storage.insert_attempts(), 0);
}

#[tokio::test]
async fn test_mixed_stream_through_pipeline() {
    // Arrange
    let storage = Arc::new(MockStorage::new());
    let handle = IngestPipeline::new(
        Classifier::default(),
        storage.clone(),
        &test_config().pipeline,
    )
    .start();

    // Act
    let messages: Vec<(&str, Vec<u8>)> = vec![
        ("bms/telemetry/PACK001", TELEMETRY_PAYLOAD.as_bytes().to_vec()),
        ("bms/telemetry/PACK001", br#"{"voltage": 3.7}"#.to_vec()),
        ("bms/telemetry/PACK002", vec![0xff]),
        ("bms/alerts/PACK002", br#"{"fault": "overheat"}"#.to_vec()),
        ("bms/status/PACK003", br#"{"status": "online"}"#.to_vec()),
        ("bms/misc/PACK004", b"hello".to_vec()),
        ("bms/misc/   ", br#"{"code": 1}"#.to_vec()),
    ];
    for (topic, payload) in messages {
        handle.submit(InboundMessage::new(topic, payload)).await.unwrap();
    }
    let summary = handle.shutdown(Duration::from_secs(5)).await;

    // Assert
    assert_eq!(summary.processed, 7);
    assert_eq!(summary.stored, 4);
    assert_eq!(summary.dropped, 3);
    assert_eq!(summary.storage_failures, 0);
    assert_eq!(storage.rows(Table::Telemetry).len(), 1);
    assert_eq!(storage.rows(Table::Alerts).len(), 1);
    assert_eq!(storage.rows(Table::DeviceStatus).len(), 1);
    assert_eq!(storage.rows(Table::RawMessages)[0]["raw_text"], json!("hello"));
}

#[tokio::test]
async fn test_storage_outage_does_not_block_later_messages() {
    let storage = Arc::new(MockStorage::new());
    let handle = IngestPipeline::new(Classifier::default(), storage.clone(), &test_config().pipeline).start();

    storage.set_failing(true);
    handle
        .submit(InboundMessage::new("bms/status/PACK001", br#"{"status":"online"}"#.to_vec()))
        .await
        .unwrap();
    // Let the failing insert finish before storage recovers.
    tokio::time::sleep(Duration::from_millis(500)).await;
    storage.set_failing(false);
    handle
        .submit(InboundMessage::new("bms/status/PACK001", br#"{"status":"offline"}"#.to_vec()))
        .await
        .unwrap();
    let summary = handle.shutdown(Duration::from_secs(5)).await;

    assert_eq!(summary.storage_failures, 1);
    assert_eq!(summary.stored, 1);
    assert_eq!(storage.rows(Table::DeviceStatus)[0]["status"], json!("offline"));
}

#[tokio::test]
async fn test_ingestor_stores_delivered_messages() {
    // Arrange
    let (transport, events) = MockTransport::with_channel(64);
    let transport = Arc::new(transport);
    let storage = storage_with_devices(&["PACK007"]);
    let mut ingestor = Ingestor::new(test_config(), transport.clone(), events, storage.clone());
    ingestor.start().await.unwrap();

    // Act
    transport
        .deliver("bms/telemetry/PACK007 ", TELEMETRY_PAYLOAD.as_bytes().to_vec())
        .await;
    transport
        .deliver("bms/telemetry/PACK007", br#"{"voltage": 3.7}"#.to_vec())
        .await;
    transport
        .deliver("bms/telemetry/PACK007", vec![0xff, 0xfe])
        .await;
    ingestor.shutdown().await.unwrap();

    // Assert
    let rows = storage.rows(Table::Telemetry);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["packsn"], json!("PACK007"));
    assert_eq!(storage.inserted_count(), 1);
}
