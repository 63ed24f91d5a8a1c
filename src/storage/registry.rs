//! Read-only view of the external device registry table

use super::{Storage, StorageError, Table};
use crate::protocol::DeviceRegistryEntry;
use crate::subscription::DeviceSource;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Device registry backed by the storage service
#[derive(Clone)]
pub struct DeviceRegistry {
    storage: Arc<dyn Storage>,
}

impl DeviceRegistry {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// All registry entries; rows that do not parse are skipped with a warning
    pub async fn entries(&self) -> Result<Vec<DeviceRegistryEntry>, StorageError> {
        let rows = self.storage.select_all(Table::DeviceRegistry).await?;
        let total = rows.len();
        let entries: Vec<DeviceRegistryEntry> = rows
            .into_iter()
            .enumerate()
            .filter_map(|(index, row)| match serde_json::from_value(row) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(row = index, "Skipping malformed registry row: {}", e);
                    None
                }
            })
            .collect();
        debug!(total, parsed = entries.len(), "Loaded device registry");
        Ok(entries)
    }

    /// A single device's entry, looked up by its serial
    pub async fn entry(&self, device_id: &str) -> Result<Option<DeviceRegistryEntry>, StorageError> {
        let Some(row) = self
            .storage
            .select_by_key(Table::DeviceRegistry, device_id.trim())
            .await?
        else {
            return Ok(None);
        };
        serde_json::from_value(row)
            .map(Some)
            .map_err(|e| StorageError::Decode(e.to_string()))
    }
}

#[async_trait]
impl DeviceSource for DeviceRegistry {
    async fn device_ids(&self) -> Result<BTreeSet<String>, StorageError> {
        Ok(self
            .entries()
            .await?
            .iter()
            .filter_map(DeviceRegistryEntry::device_id)
            .collect())
    }
}
