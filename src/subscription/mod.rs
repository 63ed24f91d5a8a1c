//! Subscription tracking reconciled against the external device registry

pub mod registry;

pub use registry::{ReconcileDelta, SubscriptionRegistry, TopicSubscription};

use crate::storage::StorageError;
use async_trait::async_trait;
use std::collections::BTreeSet;

/// Source of the device ids the ingestor should be subscribed to
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// Current set of trimmed, non-empty device ids
    async fn device_ids(&self) -> Result<BTreeSet<String>, StorageError>;
}
