//! Thread-safe metrics collection system
//!
//! Atomic counters for the hot paths (messages, inserts, publishes) and
//! mutex-protected collections for drop reasons and processing times.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Processing time samples kept for percentiles
const MAX_PROCESSING_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Ingest
    messages_received: AtomicU64,
    messages_processed: AtomicU64,
    records_stored: AtomicU64,
    storage_failures: AtomicU64,
    drops: Mutex<BTreeMap<String, u64>>,
    stored_by_stream: Mutex<BTreeMap<String, u64>>,
    processing_times: Mutex<Vec<u64>>,

    // Broker session
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connection_losses: AtomicU64,
    subscriptions_active: AtomicU64,
    subscribe_failures: AtomicU64,
    last_heartbeat: AtomicU64,
    connection_start_time: AtomicU64,

    // Outbound
    publish_cycles: AtomicU64,
    snapshots_published: AtomicU64,
    snapshot_failures: AtomicU64,

    // Lifecycle
    connection_state: Mutex<String>,
    state_transitions: AtomicU64,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_processed: AtomicU64::new(0),
            records_stored: AtomicU64::new(0),
            storage_failures: AtomicU64::new(0),
            drops: Mutex::new(BTreeMap::new()),
            stored_by_stream: Mutex::new(BTreeMap::new()),
            processing_times: Mutex::new(Vec::new()),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connection_losses: AtomicU64::new(0),
            subscriptions_active: AtomicU64::new(0),
            subscribe_failures: AtomicU64::new(0),
            last_heartbeat: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            publish_cycles: AtomicU64::new(0),
            snapshots_published: AtomicU64::new(0),
            snapshot_failures: AtomicU64::new(0),
            connection_state: Mutex::new("disconnected".to_string()),
            state_transitions: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Ingest metrics
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the running total of processed messages
    pub fn message_processed(&self, duration: Duration) -> u64 {
        self.record_processing_time(duration);
        self.messages_processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_stored(&self, stream: &str) {
        self.records_stored.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut stored) = self.stored_by_stream.lock() {
            *stored.entry(stream.to_string()).or_insert(0) += 1;
        }
    }

    pub fn storage_failed(&self) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self, reason: &str) {
        if let Ok(mut drops) = self.drops.lock() {
            *drops.entry(reason.to_string()).or_insert(0) += 1;
        }
    }

    fn record_processing_time(&self, duration: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > MAX_PROCESSING_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Broker session metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connection_losses.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn set_subscriptions_active(&self, count: usize) {
        self.subscriptions_active
            .store(count as u64, Ordering::Relaxed);
    }

    pub fn subscribe_failed(&self) {
        self.subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat(&self) {
        self.last_heartbeat
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Outbound metrics
    pub fn publish_cycle_completed(&self, successes: usize, failures: usize) {
        self.publish_cycles.fetch_add(1, Ordering::Relaxed);
        self.snapshots_published
            .fetch_add(successes as u64, Ordering::Relaxed);
        self.snapshot_failures
            .fetch_add(failures as u64, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_connection_state(&self, state: &str) {
        if let Ok(mut current_state) = self.connection_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.messages_received,
            &self.messages_processed,
            &self.records_stored,
            &self.storage_failures,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connection_losses,
            &self.subscriptions_active,
            &self.subscribe_failures,
            &self.last_heartbeat,
            &self.connection_start_time,
            &self.publish_cycles,
            &self.snapshots_published,
            &self.snapshot_failures,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut drops) = self.drops.lock() {
            drops.clear();
        }
        if let Ok(mut stored) = self.stored_by_stream.lock() {
            stored.clear();
        }
        if let Ok(mut times) = self.processing_times.lock() {
            times.clear();
        }
        if let Ok(mut state) = self.connection_state.lock() {
            *state = "disconnected".to_string();
        }
    }

    /// Calculate processing time statistics (pure function)
    fn calculate_processing_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.processing_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut sorted_times = times.clone();
        sorted_times.sort_unstable();
        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
        )
    }

    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_processing_time_ms, p50, p95) = self.calculate_processing_time_statistics();
        let drops = self.drops.lock().map(|d| d.clone()).unwrap_or_default();
        let stored_by_stream = self
            .stored_by_stream
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        let current_state = self
            .connection_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            ingest: IngestMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_processed: self.messages_processed.load(Ordering::Relaxed),
                records_stored: self.records_stored.load(Ordering::Relaxed),
                storage_failures: self.storage_failures.load(Ordering::Relaxed),
                messages_dropped: drops.values().sum(),
                drops_by_reason: drops,
                stored_by_stream,
                avg_processing_time_ms,
                processing_time_p50_ms: p50,
                processing_time_p95_ms: p95,
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connection_losses: self.connection_losses.load(Ordering::Relaxed),
                subscriptions_active: self.subscriptions_active.load(Ordering::Relaxed),
                subscribe_failures: self.subscribe_failures.load(Ordering::Relaxed),
                last_heartbeat: self.last_heartbeat.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            outbound: OutboundMetrics {
                publish_cycles: self.publish_cycles.load(Ordering::Relaxed),
                snapshots_published: self.snapshots_published.load(Ordering::Relaxed),
                snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                connection_state: current_state,
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub ingest: IngestMetrics,
    pub mqtt: MqttMetrics,
    pub outbound: OutboundMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestMetrics {
    pub messages_received: u64,
    pub messages_processed: u64,
    pub records_stored: u64,
    pub storage_failures: u64,
    pub messages_dropped: u64,
    pub drops_by_reason: BTreeMap<String, u64>,
    pub stored_by_stream: BTreeMap<String, u64>,
    pub avg_processing_time_ms: f64,
    pub processing_time_p50_ms: f64,
    pub processing_time_p95_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connection_losses: u64,
    pub subscriptions_active: u64,
    pub subscribe_failures: u64,
    pub last_heartbeat: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMetrics {
    pub publish_cycles: u64,
    pub snapshots_published: u64,
    pub snapshot_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleMetrics {
    pub connection_state: String,
    pub state_transitions: u64,
    pub uptime_seconds: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}
