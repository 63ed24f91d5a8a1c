//! Supabase (PostgREST) storage implementation
//!
//! Rows are written with `POST /rest/v1/<table>` and read with `GET`
//! filters; the service key is sent both as `apikey` and as a bearer token.

use super::{Storage, StorageError, Table};
use crate::config::{IngestorConfig, TableNames};
use crate::error::sanitize_error_message;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Backoff between insert attempts on transient failures
const INSERT_RETRY_DELAYS_MS: [u64; 2] = [100, 200];

/// Supabase storage configuration
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub tables: TableNames,
}

impl SupabaseConfig {
    /// Resolve from ingestor configuration; the key comes from the environment
    pub fn from_ingestor_config(config: &IngestorConfig) -> Result<Self, StorageError> {
        let api_key = config
            .get_storage_key()
            .map_err(|e| StorageError::NotConfigured(e.to_string()))?;
        Ok(Self {
            url: config.storage.url.clone(),
            api_key,
            timeout: Duration::from_secs(config.storage.timeout_secs),
            tables: config.storage.tables.clone(),
        })
    }
}

/// Supabase storage client
pub struct SupabaseStorage {
    config: SupabaseConfig,
    rest_base: String,
    client: Client,
}

impl SupabaseStorage {
    pub fn new(config: SupabaseConfig) -> Result<Self, StorageError> {
        if config.api_key.trim().is_empty() {
            return Err(StorageError::NotConfigured(
                "storage service key is required".to_string(),
            ));
        }
        let parsed = Url::parse(config.url.trim())
            .map_err(|e| StorageError::NotConfigured(format!("invalid storage URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(StorageError::NotConfigured(format!(
                "storage URL must be http(s), got '{}'",
                parsed.scheme()
            )));
        }
        let rest_base = format!("{}/rest/v1", parsed.as_str().trim_end_matches('/'));

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StorageError::Network(e.to_string()))?;

        Ok(Self {
            config,
            rest_base,
            client,
        })
    }

    /// Endpoint for a table (pure function)
    pub fn endpoint(&self, table: Table) -> String {
        format!("{}/{}", self.rest_base, table.name(&self.config.tables))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
    }

    async fn check_status(response: Response) -> Result<Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StorageError::Rejected {
            status: status.as_u16(),
            body: sanitize_error_message(&body),
        })
    }

    async fn fetch_rows(&self, request: RequestBuilder) -> Result<Vec<Value>, StorageError> {
        let response = self
            .authorized(request)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;
        let response = Self::check_status(response).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| StorageError::Decode(e.to_string()))?;
        match body {
            Value::Array(rows) => Ok(rows),
            other => Err(StorageError::Decode(format!(
                "expected a JSON array, got {}",
                json_type_name(&other)
            ))),
        }
    }

    async fn insert_once(&self, table: Table, row: &Map<String, Value>) -> Result<(), StorageError> {
        let response = self
            .authorized(self.client.post(self.endpoint(table)))
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;
        Self::check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl Storage for SupabaseStorage {
    async fn insert(&self, table: Table, row: &Map<String, Value>) -> Result<(), StorageError> {
        let mut last_error = None;
        for (attempt, &delay_ms) in std::iter::once(&0u64)
            .chain(INSERT_RETRY_DELAYS_MS.iter())
            .enumerate()
        {
            if attempt > 0 {
                debug!("Storage insert retry {} after {}ms", attempt, delay_ms);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            match self.insert_once(table, row).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!(table = table.name(&self.config.tables), "Transient insert failure: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| StorageError::Network("insert failed".to_string())))
    }

    async fn select_latest(&self, table: Table, limit: usize) -> Result<Vec<Value>, StorageError> {
        let order = format!("{}.desc", self.config.tables.order_column);
        let request = self.client.get(self.endpoint(table)).query(&[
            ("select", "*".to_string()),
            ("order", order),
            ("limit", limit.to_string()),
        ]);
        self.fetch_rows(request).await
    }

    async fn select_all(&self, table: Table) -> Result<Vec<Value>, StorageError> {
        let request = self
            .client
            .get(self.endpoint(table))
            .query(&[("select", "*")]);
        self.fetch_rows(request).await
    }

    async fn select_by_key(
        &self,
        table: Table,
        device_id: &str,
    ) -> Result<Option<Value>, StorageError> {
        let key_column = match table {
            Table::Telemetry | Table::DeviceRegistry => self.config.tables.registry_key.as_str(),
            Table::Alerts | Table::DeviceStatus | Table::RawMessages => "device_id",
        };
        let request = self.client.get(self.endpoint(table)).query(&[
            ("select", "*".to_string()),
            (key_column, format!("eq.{device_id}")),
            ("limit", "1".to_string()),
        ]);
        Ok(self.fetch_rows(request).await?.into_iter().next())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str, key: &str) -> SupabaseConfig {
        SupabaseConfig {
            url: url.to_string(),
            api_key: key.to_string(),
            timeout: Duration::from_secs(5),
            tables: TableNames::default(),
        }
    }

    #[test]
    fn test_requires_api_key() {
        let result = SupabaseStorage::new(config("https://x.supabase.co", ""));
        assert!(matches!(result, Err(StorageError::NotConfigured(_))));
    }

    #[test]
    fn test_rejects_non_http_urls() {
        assert!(SupabaseStorage::new(config("ftp://x", "key")).is_err());
        assert!(SupabaseStorage::new(config("not a url", "key")).is_err());
    }

    #[test]
    fn test_endpoint_construction() {
        let storage = SupabaseStorage::new(config("https://x.supabase.co/", "key")).unwrap();
        assert_eq!(
            storage.endpoint(Table::Telemetry),
            "https://x.supabase.co/rest/v1/battery_cell_data"
        );
        assert_eq!(
            storage.endpoint(Table::DeviceRegistry),
            "https://x.supabase.co/rest/v1/battery_pack_info"
        );
    }
}
