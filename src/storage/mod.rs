//! Storage boundary
//!
//! The ingestor only inserts classified rows and reads back what it needs
//! for the device registry and startup reporting. No schema management.

pub mod registry;
pub mod supabase;

pub use registry::DeviceRegistry;
pub use supabase::{SupabaseConfig, SupabaseStorage};

use crate::config::TableNames;
use crate::protocol::StreamKind;
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Logical tables the ingestor touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Telemetry,
    Alerts,
    DeviceStatus,
    RawMessages,
    DeviceRegistry,
}

impl Table {
    pub fn name<'a>(&self, names: &'a TableNames) -> &'a str {
        match self {
            Table::Telemetry => &names.telemetry,
            Table::Alerts => &names.alerts,
            Table::DeviceStatus => &names.device_status,
            Table::RawMessages => &names.raw_messages,
            Table::DeviceRegistry => &names.registry,
        }
    }
}

impl From<StreamKind> for Table {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Telemetry => Table::Telemetry,
            StreamKind::Alert => Table::Alerts,
            StreamKind::Status => Table::DeviceStatus,
            StreamKind::Raw => Table::RawMessages,
        }
    }
}

/// Storage errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    #[error("storage not configured: {0}")]
    NotConfigured(String),
    #[error("storage unreachable: {0}")]
    Network(String),
    #[error("storage rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("unexpected storage response: {0}")]
    Decode(String),
}

impl StorageError {
    /// Errors worth one more attempt
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Network(_) => true,
            StorageError::Rejected { status, .. } => *status == 429 || *status >= 500,
            StorageError::NotConfigured(_) | StorageError::Decode(_) => false,
        }
    }
}

/// Insert/select abstraction over the storage service. Implementations must
/// be safe for concurrent use by pipeline workers.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert(&self, table: Table, row: &Map<String, Value>) -> Result<(), StorageError>;

    /// Most recent rows first
    async fn select_latest(&self, table: Table, limit: usize) -> Result<Vec<Value>, StorageError>;

    async fn select_all(&self, table: Table) -> Result<Vec<Value>, StorageError>;

    async fn select_by_key(
        &self,
        table: Table,
        device_id: &str,
    ) -> Result<Option<Value>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_kinds_map_to_tables() {
        let names = TableNames::default();
        assert_eq!(Table::from(StreamKind::Telemetry).name(&names), "battery_cell_data");
        assert_eq!(Table::from(StreamKind::Alert).name(&names), "alerts");
        assert_eq!(Table::from(StreamKind::Status).name(&names), "device_status");
        assert_eq!(Table::from(StreamKind::Raw).name(&names), "raw_messages");
        assert_eq!(Table::DeviceRegistry.name(&names), "battery_pack_info");
    }

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Network("timeout".into()).is_transient());
        assert!(StorageError::Rejected { status: 503, body: String::new() }.is_transient());
        assert!(!StorageError::Rejected { status: 400, body: String::new() }.is_transient());
        assert!(!StorageError::Decode("bad".into()).is_transient());
    }
}
