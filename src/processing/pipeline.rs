//! Bounded, topic-sharded worker pool between the broker and storage
//!
//! Each worker owns one bounded queue. Messages are routed to a worker by a
//! hash of their topic, so one topic's messages are classified and stored in
//! delivery order. A full queue makes `submit` wait, which stalls the
//! dispatcher and in turn the broker poll loop; nothing is dropped.

use super::classifier::Classifier;
use crate::config::PipelineSection;
use crate::error::{IngestError, IngestResult};
use crate::ingest_span;
use crate::observability::metrics;
use crate::protocol::{DropReason, InboundMessage, StreamKind};
use crate::storage::{Storage, StorageError, Table};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// A progress line is logged every this many processed messages
const PROGRESS_EVERY: u64 = 10;

/// What happened to one message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Stored(StreamKind),
    Dropped(DropReason),
    StorageFailed(StorageError),
    /// Processing panicked; the message is lost but the worker keeps going
    Panicked,
}

/// Counters for one pipeline instance
#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    stored: AtomicU64,
    dropped: AtomicU64,
    storage_failures: AtomicU64,
}

/// Point-in-time copy of `PipelineStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub processed: u64,
    pub stored: u64,
    pub dropped: u64,
    pub storage_failures: u64,
}

impl PipelineStats {
    fn record(&self, outcome: &MessageOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            MessageOutcome::Stored(_) => &self.stored,
            MessageOutcome::Dropped(_) | MessageOutcome::Panicked => &self.dropped,
            MessageOutcome::StorageFailed(_) => &self.storage_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            processed: self.processed.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
        }
    }
}

/// Classify one message and store the resulting record.
///
/// Every drop and every failed insert produces exactly one log line naming
/// the topic and the reason.
pub async fn process_message(
    classifier: &Classifier,
    storage: &dyn Storage,
    message: &InboundMessage,
) -> MessageOutcome {
    let record = match classifier.classify(&message.topic, &message.raw_payload, message.received_at)
    {
        Ok(record) => record,
        Err(reason) => {
            warn!(topic = %message.topic, reason = %reason, "Dropping message");
            metrics().message_dropped(reason.label());
            return MessageOutcome::Dropped(reason);
        }
    };

    let table = Table::from(record.stream_kind);
    match storage.insert(table, &record.to_row()).await {
        Ok(()) => {
            debug!(
                topic = %message.topic,
                device_id = %record.device_id,
                stream = %record.stream_kind,
                "Record stored"
            );
            metrics().record_stored(record.stream_kind.as_str());
            MessageOutcome::Stored(record.stream_kind)
        }
        Err(e) => {
            error!(
                topic = %message.topic,
                device_id = %record.device_id,
                stream = %record.stream_kind,
                "Storage insert failed: {}",
                e
            );
            metrics().storage_failed();
            MessageOutcome::StorageFailed(e)
        }
    }
}

/// Builder for the worker pool
pub struct IngestPipeline {
    classifier: Classifier,
    storage: Arc<dyn Storage>,
    workers: usize,
    queue_capacity: usize,
}

impl IngestPipeline {
    pub fn new(classifier: Classifier, storage: Arc<dyn Storage>, section: &PipelineSection) -> Self {
        Self {
            classifier,
            storage,
            workers: section.workers.max(1),
            queue_capacity: section.queue_capacity.max(1),
        }
    }

    /// Spawn the workers
    pub fn start(self) -> PipelineHandle {
        let stats = Arc::new(PipelineStats::default());
        let mut senders = Vec::with_capacity(self.workers);
        let mut workers = Vec::with_capacity(self.workers);

        for worker_id in 0..self.workers {
            let (tx, rx) = mpsc::channel(self.queue_capacity);
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(
                worker_id,
                rx,
                self.classifier,
                self.storage.clone(),
                stats.clone(),
            )));
        }
        info!(workers = self.workers, queue_capacity = self.queue_capacity, "Ingest pipeline started");

        PipelineHandle {
            senders,
            workers,
            stats,
        }
    }
}

async fn run_worker(
    worker_id: usize,
    mut rx: mpsc::Receiver<InboundMessage>,
    classifier: Classifier,
    storage: Arc<dyn Storage>,
    stats: Arc<PipelineStats>,
) {
    while let Some(message) = rx.recv().await {
        let started = Instant::now();
        let topic = message.topic.clone();
        let span = ingest_span!(worker_id, topic = %topic);
        let task_storage = storage.clone();
        // Awaited in place, so per-topic order is kept; a panic stays in the task.
        let task = tokio::spawn(
            async move { process_message(&classifier, task_storage.as_ref(), &message).await }
                .instrument(span),
        );
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(worker_id, %topic, "Message processing panicked, message lost: {}", e);
                metrics().message_dropped("processing_panic");
                MessageOutcome::Panicked
            }
        };
        stats.record(&outcome);

        let total = metrics().message_processed(started.elapsed());
        if total % PROGRESS_EVERY == 0 {
            let summary = stats.summary();
            info!(
                processed = total,
                stored = summary.stored,
                dropped = summary.dropped,
                storage_failures = summary.storage_failures,
                "Ingest progress"
            );
        }
    }
    debug!(worker_id, "Pipeline worker stopped");
}

/// Running pipeline: submit messages, read stats, drain on shutdown
pub struct PipelineHandle {
    senders: Vec<mpsc::Sender<InboundMessage>>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    /// Queue a message on its topic's worker, waiting while that queue is full
    pub async fn submit(&self, message: InboundMessage) -> IngestResult<()> {
        metrics().message_received();
        let shard = shard_for(&message.topic, self.senders.len());
        self.senders[shard]
            .send(message)
            .await
            .map_err(|e| IngestError::internal(format!("pipeline worker {shard} stopped, message for '{}' not processed", e.0.topic)))
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn summary(&self) -> PipelineSummary {
        self.stats.summary()
    }

    /// Stop accepting messages and drain queued work within `grace`.
    /// Workers still running after the grace period are aborted.
    pub async fn shutdown(self, grace: Duration) -> PipelineSummary {
        let PipelineHandle {
            senders,
            workers,
            stats,
        } = self;
        drop(senders);

        let deadline = tokio::time::Instant::now() + grace;
        for (worker_id, mut worker) in workers.into_iter().enumerate() {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                warn!(worker_id, "Pipeline worker did not drain within grace period, aborting");
                worker.abort();
            }
        }

        let summary = stats.summary();
        info!(
            processed = summary.processed,
            stored = summary.stored,
            dropped = summary.dropped,
            storage_failures = summary.storage_failures,
            "Ingest pipeline stopped"
        );
        summary
    }
}

/// Worker index for a topic (stable within the process)
pub fn shard_for(topic: &str, workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    topic.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockStorage;
    use serde_json::json;

    fn section(workers: usize) -> PipelineSection {
        PipelineSection {
            workers,
            queue_capacity: 4,
        }
    }

    const TELEMETRY: &str =
        r#"{"cell_voltages":[3.7,3.71],"cell_socs":[80,81],"cell_temperatures":[25,26]}"#;

    #[tokio::test]
    async fn test_process_message_stores_telemetry() {
        let storage = MockStorage::new();
        let message = InboundMessage::new("bms/telemetry/PACK007", TELEMETRY.as_bytes().to_vec());

        let outcome = process_message(&Classifier::default(), &storage, &message).await;

        assert_eq!(outcome, MessageOutcome::Stored(StreamKind::Telemetry));
        let rows = storage.rows(Table::Telemetry);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["packsn"], json!("PACK007"));
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported_not_fatal() {
        let storage = MockStorage::new();
        storage.set_failing(true);
        let message = InboundMessage::new("bms/status/PACK001", br#"{"status":"online"}"#.to_vec());

        let outcome = process_message(&Classifier::default(), &storage, &message).await;

        assert!(matches!(outcome, MessageOutcome::StorageFailed(_)));
    }

    #[tokio::test]
    async fn test_pipeline_drains_on_shutdown() {
        // Arrange
        let storage = Arc::new(MockStorage::new());
        let handle = IngestPipeline::new(Classifier::default(), storage.clone(), &section(3)).start();

        // Act
        for n in 0..12 {
            let topic = format!("bms/telemetry/PACK{n:03}");
            handle
                .submit(InboundMessage::new(topic, TELEMETRY.as_bytes().to_vec()))
                .await
                .unwrap();
        }
        handle
            .submit(InboundMessage::new("bms/telemetry/PACK001", vec![0xff, 0xfe]))
            .await
            .unwrap();
        let summary = handle.shutdown(Duration::from_secs(5)).await;

        // Assert
        assert_eq!(summary.processed, 13);
        assert_eq!(summary.stored, 12);
        assert_eq!(summary.dropped, 1);
        assert_eq!(storage.rows(Table::Telemetry).len(), 12);
    }

    #[tokio::test]
    async fn test_single_topic_order_preserved() {
        let storage = Arc::new(MockStorage::new());
        let handle = IngestPipeline::new(Classifier::default(), storage.clone(), &section(4)).start();

        for n in 0..20 {
            let payload = json!({"status": "ok", "seq": n}).to_string();
            handle
                .submit(InboundMessage::new("bms/status/PACK001", payload.into_bytes()))
                .await
                .unwrap();
        }
        handle.shutdown(Duration::from_secs(5)).await;

        let seqs: Vec<i64> = storage
            .rows(Table::DeviceStatus)
            .iter()
            .filter_map(|row| row["seq"].as_i64())
            .collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_insert() {
        // Arrange
        let storage = Arc::new(MockStorage::new());
        storage.panic_on_device("PACK666");
        let handle = IngestPipeline::new(Classifier::default(), storage.clone(), &section(1)).start();

        // Act
        for topic in ["bms/telemetry/PACK666", "bms/telemetry/PACK001", "bms/telemetry/PACK002"] {
            handle
                .submit(InboundMessage::new(topic, TELEMETRY.as_bytes().to_vec()))
                .await
                .unwrap();
        }
        let summary = handle.shutdown(Duration::from_secs(5)).await;

        // Assert
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.stored, 2);
        assert_eq!(summary.dropped, 1);
        let stored: Vec<_> = storage
            .rows(Table::Telemetry)
            .iter()
            .map(|row| row["packsn"].clone())
            .collect();
        assert_eq!(stored, vec![json!("PACK001"), json!("PACK002")]);
    }

    #[test]
    fn test_shard_is_stable_and_in_range() {
        for workers in 1..8 {
            let shard = shard_for("bms/telemetry/PACK001", workers);
            assert!(shard < workers);
            assert_eq!(shard, shard_for("bms/telemetry/PACK001", workers));
        }
    }
}
