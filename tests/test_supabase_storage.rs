//! Integration tests for the PostgREST storage client
//!
//! Tests behavioral contracts against a mock HTTP server:
//! - Insert requests carry the service key and target the mapped table
//! - Transient failures are retried, rejections are not
//! - Latest and keyed reads use the expected filters

use bms_ingestor::config::TableNames;
use bms_ingestor::storage::{Storage, StorageError, SupabaseConfig, SupabaseStorage, Table};
use serde_json::{json, Map, Value};
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn storage_for(server: &MockServer) -> SupabaseStorage {
    SupabaseStorage::new(SupabaseConfig {
        url: server.uri(),
        api_key: "service-key".to_string(),
        timeout: Duration::from_secs(5),
        tables: TableNames::default(),
    })
    .unwrap()
}

fn telemetry_row() -> Map<String, Value> {
    let value = json!({
        "packsn": "PACK001",
        "cell_voltages": [3.7, 3.71],
        "cell_socs": [80, 81],
        "cell_temperatures": [25, 26],
        "created_at": "2024-06-01T12:00:00.000Z"
    });
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_insert_posts_row_with_service_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/battery_cell_data"))
        .and(header("apikey", "service-key"))
        .and(header("Authorization", "Bearer service-key"))
        .and(header("Prefer", "return=minimal"))
        .and(body_json(Value::Object(telemetry_row())))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let storage = storage_for(&server);

    storage.insert(Table::Telemetry, &telemetry_row()).await.unwrap();
}

#[tokio::test]
async fn test_insert_retries_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/alerts"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/alerts"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let storage = storage_for(&server);
    let row = json!({"device_id": "PACK001", "fault": "overheat"});

    storage
        .insert(Table::Alerts, row.as_object().unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_insert_gives_up_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let storage = storage_for(&server);
    let result = storage
        .insert(Table::RawMessages, json!({"raw_text": "x"}).as_object().unwrap())
        .await;

    assert!(matches!(
        result,
        Err(StorageError::Rejected { status: 500, .. })
    ));
}

#[tokio::test]
async fn test_rejection_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/device_status"))
        .respond_with(
            ResponseTemplate::new(400).set_body_string(r#"{"message":"column \"bogus\" does not exist"}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let storage = storage_for(&server);
    let result = storage
        .insert(Table::DeviceStatus, json!({"bogus": 1}).as_object().unwrap())
        .await;

    match result {
        Err(StorageError::Rejected { status, body }) => {
            assert_eq!(status, 400);
            assert!(body.contains("bogus"));
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_select_latest_orders_and_limits() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/battery_cell_data"))
        .and(query_param("order", "created_at.desc"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"packsn": "PACK002", "created_at": "2024-06-01T12:00:01.000Z"},
            {"packsn": "PACK001", "created_at": "2024-06-01T12:00:00.000Z"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let storage = storage_for(&server);
    let rows = storage.select_latest(Table::Telemetry, 2).await.unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["packsn"], "PACK002");
}

#[tokio::test]
async fn test_select_by_key_filters_registry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/battery_pack_info"))
        .and(query_param("packsn", "eq.PACK001"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"packsn": "PACK001", "manufacturer": "Acme"}])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/battery_pack_info"))
        .and(query_param("packsn", "eq.PACK404"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let storage = storage_for(&server);

    let found = storage
        .select_by_key(Table::DeviceRegistry, "PACK001")
        .await
        .unwrap();
    assert_eq!(found.unwrap()["manufacturer"], "Acme");

    let missing = storage
        .select_by_key(Table::DeviceRegistry, "PACK404")
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_non_array_response_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": []})))
        .mount(&server)
        .await;

    let storage = storage_for(&server);
    let result = storage.select_all(Table::DeviceRegistry).await;

    assert!(matches!(result, Err(StorageError::Decode(_))));
}

#[tokio::test]
async fn test_unreachable_server_is_network_error() {
    let storage = SupabaseStorage::new(SupabaseConfig {
        url: "http://127.0.0.1:1".to_string(),
        api_key: "service-key".to_string(),
        timeout: Duration::from_secs(2),
        tables: TableNames::default(),
    })
    .unwrap();

    let result = storage.select_all(Table::DeviceRegistry).await;

    assert!(matches!(result, Err(StorageError::Network(_))));
}
