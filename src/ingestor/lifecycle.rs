//! Ingestor lifecycle management
//!
//! `Ingestor` wires the broker session, the event dispatcher, the ingest
//! pipeline, the health monitor and the optional health server, and tears
//! them down in order on shutdown.

use super::health_monitor::HealthMonitor;
use super::manager::ConnectionManager;
use super::state_machine::{ConnectionState, ReconnectConfig};
use crate::config::IngestorConfig;
use crate::error::{IngestError, IngestResult};
use crate::lifecycle_span;
use crate::observability::{metrics, HealthServer};
use crate::outbound::OutboundPublisher;
use crate::processing::{Classifier, IngestPipeline, PipelineHandle};
use crate::protocol::{DeviceRegistryEntry, InboundMessage};
use crate::storage::{
    DeviceRegistry, Storage, StorageError, SupabaseConfig, SupabaseStorage, Table,
};
use crate::subscription::SubscriptionRegistry;
use crate::transport::mqtt::{MqttSession, SessionSettings};
use crate::transport::{qos_from_level, Transport, TransportEvent};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the transport event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// How long background tasks get to notice shutdown before being aborted
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// What storage holds right now: registry entries and the latest telemetry
#[derive(Debug, Clone, Default)]
pub struct StorageReport {
    pub devices: Vec<DeviceRegistryEntry>,
    pub latest_telemetry: Vec<Value>,
}

impl StorageReport {
    pub fn log_summary(&self) {
        info!(devices = self.devices.len(), "Device registry loaded");
        match self.latest_telemetry.first() {
            Some(row) => {
                let packsn = row.get("packsn").and_then(Value::as_str).unwrap_or("<unknown>");
                let created_at = row
                    .get("created_at")
                    .and_then(Value::as_str)
                    .unwrap_or("<unknown>");
                info!(%packsn, %created_at, "Latest telemetry record");
            }
            None => info!("No telemetry records stored yet"),
        }
    }
}

/// Read the registry and the `limit` most recent telemetry rows. Used as the
/// startup storage check, so any failure here is fatal to startup.
pub async fn storage_report(
    storage: Arc<dyn Storage>,
    limit: usize,
) -> Result<StorageReport, StorageError> {
    let devices = DeviceRegistry::new(storage.clone()).entries().await?;
    let latest_telemetry = storage.select_latest(Table::Telemetry, limit).await?;
    Ok(StorageReport {
        devices,
        latest_telemetry,
    })
}

/// The running ingestor
pub struct Ingestor<T: Transport + 'static> {
    config: IngestorConfig,
    manager: Arc<ConnectionManager<T>>,
    storage: Arc<dyn Storage>,
    registry: DeviceRegistry,
    publisher: Arc<OutboundPublisher<T>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    dispatcher_handle: Option<JoinHandle<PipelineHandle>>,
    monitor_handle: Option<JoinHandle<()>>,
    stats_handle: Option<JoinHandle<()>>,
    health_handle: Option<JoinHandle<()>>,
}

impl Ingestor<MqttSession> {
    /// Build the production ingestor: MQTT session plus PostgREST storage.
    /// TLS and storage misconfiguration fail here, before anything connects.
    pub fn from_config(config: IngestorConfig) -> IngestResult<Self> {
        let settings = SessionSettings::from_config(&config)?;
        let storage = SupabaseStorage::new(SupabaseConfig::from_ingestor_config(&config)?)?;
        let (session, events) = MqttSession::with_channel(settings, EVENT_CHANNEL_CAPACITY);
        Ok(Self::new(config, Arc::new(session), events, Arc::new(storage)))
    }
}

impl<T: Transport + 'static> Ingestor<T> {
    pub fn new(
        config: IngestorConfig,
        transport: Arc<T>,
        events: mpsc::Receiver<TransportEvent>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let registry = DeviceRegistry::new(storage.clone());
        let manager = Arc::new(ConnectionManager::new(
            transport,
            Arc::new(registry.clone()),
            SubscriptionRegistry::from_config(&config.subscriptions),
            ReconnectConfig::from(&config.reconnect),
            qos_from_level(config.mqtt.qos),
            config.mqtt.status_topic.clone(),
        ));
        let publisher = Arc::new(OutboundPublisher::new(
            manager.clone(),
            config.mqtt.control_topic.clone(),
            config.timing.publish_spacing(),
        ));

        Self {
            config,
            manager,
            storage,
            registry,
            publisher,
            events: Some(events),
            dispatcher_handle: None,
            monitor_handle: None,
            stats_handle: None,
            health_handle: None,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager<T>> {
        &self.manager
    }

    pub fn publisher(&self) -> &Arc<OutboundPublisher<T>> {
        &self.publisher
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Start ingesting.
    ///
    /// Storage must answer the startup check; that failure is returned and
    /// is fatal. A broker that cannot be reached is not: the health monitor
    /// keeps retrying.
    pub async fn start(&mut self) -> IngestResult<()> {
        let span = lifecycle_span!(phase = "start");
        async {
            let events = self
                .events
                .take()
                .ok_or_else(|| IngestError::initialization("ingestor already started"))?;

            info!("Probing storage");
            let report = storage_report(self.storage.clone(), 1).await?;
            report.log_summary();

            let pipeline = IngestPipeline::new(
                Classifier::new(self.config.subscriptions.device_id_source),
                self.storage.clone(),
                &self.config.pipeline,
            )
            .start();

            let monitor = HealthMonitor::new(
                self.manager.clone(),
                self.publisher.clone(),
                self.registry.clone(),
                self.config.timing.health_check_interval(),
                self.config.timing.reconnect_wait(),
            );
            let wake = monitor.waker();

            self.dispatcher_handle = Some(Self::spawn_dispatcher(
                self.manager.clone(),
                events,
                pipeline,
                wake.clone(),
            ));

            info!(
                host = %self.config.mqtt.host,
                port = self.config.mqtt.port,
                "Connecting to broker"
            );
            match self.manager.start().await {
                Ok(()) => {
                    let attempts = self.publisher.publish_cycle(&self.registry).await;
                    debug!(published = attempts.len(), "Initial snapshot cycle done");
                }
                Err(e) => {
                    warn!("Initial broker connect failed, retrying in background: {}", e);
                    wake.notify_one();
                }
            }

            self.monitor_handle = Some(monitor.spawn());
            self.stats_handle = Some(Self::spawn_stats_task(self.config.timing.stats_interval()));
            if let Some(port) = self.config.health.port {
                self.health_handle = Some(self.spawn_health_server(port));
            }

            info!(state = self.manager.state().label(), "Ingestor started");
            Ok::<(), IngestError>(())
        }
        .instrument(span)
        .await
    }

    /// Route transport events until the channel closes or shutdown begins.
    /// Returns the pipeline so shutdown can drain it.
    fn spawn_dispatcher(
        manager: Arc<ConnectionManager<T>>,
        mut events: mpsc::Receiver<TransportEvent>,
        pipeline: PipelineHandle,
        wake: Arc<Notify>,
    ) -> JoinHandle<PipelineHandle> {
        let mut shutdown = manager.shutdown_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = events.recv() => {
                        let Some(event) = event else {
                            debug!("Transport event channel closed");
                            break;
                        };
                        Self::dispatch(&manager, &pipeline, &wake, event).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            // Messages already delivered are still handed to the pipeline.
            while let Ok(event) = events.try_recv() {
                if let TransportEvent::MessageArrived(message) = event {
                    Self::submit_or_log(&pipeline, message).await;
                }
            }
            pipeline
        })
    }

    async fn dispatch(
        manager: &ConnectionManager<T>,
        pipeline: &PipelineHandle,
        wake: &Notify,
        event: TransportEvent,
    ) {
        match event {
            TransportEvent::MessageArrived(message) => Self::submit_or_log(pipeline, message).await,
            TransportEvent::Disconnected { reason } => {
                manager.handle_connection_lost(&reason);
                wake.notify_one();
            }
            TransportEvent::Connected => debug!("Broker acknowledged connect"),
        }
    }

    /// A worker that cannot take the message loses only that message
    async fn submit_or_log(pipeline: &PipelineHandle, message: InboundMessage) {
        if let Err(e) = pipeline.submit(message).await {
            error!("Message lost: {}", e.sanitized_message());
            metrics().message_dropped("pipeline_unavailable");
        }
    }

    fn spawn_stats_task(interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick completes immediately, skip it

            loop {
                ticker.tick().await;
                let snapshot = metrics().get_metrics();
                info!(
                    received = snapshot.ingest.messages_received,
                    stored = snapshot.ingest.records_stored,
                    dropped = snapshot.ingest.messages_dropped,
                    storage_failures = snapshot.ingest.storage_failures,
                    subscriptions = snapshot.mqtt.subscriptions_active,
                    state = %snapshot.lifecycle.connection_state,
                    "Ingest statistics"
                );
            }
        })
    }

    fn spawn_health_server(&self, port: u16) -> JoinHandle<()> {
        let server = Arc::new(HealthServer::new(
            env!("CARGO_PKG_NAME"),
            port,
            self.manager.subscribe_state(),
        ));
        let shutdown = self.manager.shutdown_signal();
        tokio::spawn(async move {
            if let Err(e) = server.start(shutdown).await {
                error!(port, "Health server failed: {}", e);
            }
        })
    }

    /// Graceful shutdown: enter ShuttingDown (offline marker goes out while
    /// the session is still up), stop the background tasks, drain the
    /// pipeline within the grace period, then close the session.
    pub async fn shutdown(&mut self) -> IngestResult<()> {
        let span = lifecycle_span!(phase = "shutdown");
        async {
            info!("Shutting down ingestor");
            self.manager.begin_shutdown().await;

            if let Some(handle) = self.monitor_handle.take() {
                stop_task("health monitor", handle).await;
            }
            if let Some(handle) = self.stats_handle.take() {
                handle.abort();
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!("Stats task shutdown error: {}", e);
                    }
                }
            }

            if let Some(handle) = self.dispatcher_handle.take() {
                match handle.await {
                    Ok(pipeline) => {
                        pipeline.shutdown(self.config.timing.shutdown_grace()).await;
                    }
                    Err(e) => error!("Dispatcher shutdown error: {}", e),
                }
            }

            if let Err(e) = self.manager.shutdown().await {
                warn!("Broker disconnect failed: {}", e);
            }

            if let Some(handle) = self.health_handle.take() {
                stop_task("health server", handle).await;
            }

            info!("Ingestor shutdown complete");
            Ok::<(), IngestError>(())
        }
        .instrument(span)
        .await
    }
}

/// Give a task that watches the shutdown signal time to finish, then abort it
async fn stop_task(name: &str, mut handle: JoinHandle<()>) {
    match tokio::time::timeout(TASK_STOP_TIMEOUT, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => error!(task = name, "Task ended with error: {}", e),
        Err(_) => {
            warn!(task = name, "Task did not stop in time, aborting");
            handle.abort();
        }
    }
}

/// Resolve when the watched state satisfies `predicate`, or give up after
/// `timeout`. Returns whether the predicate was met.
pub async fn wait_for_state<F>(
    mut state_rx: watch::Receiver<ConnectionState>,
    timeout: Duration,
    predicate: F,
) -> bool
where
    F: FnMut(&ConnectionState) -> bool,
{
    matches!(
        tokio::time::timeout(timeout, state_rx.wait_for(predicate)).await,
        Ok(Ok(_))
    )
}
