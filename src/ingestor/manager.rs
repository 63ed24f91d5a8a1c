//! Connection State Machine
//!
//! `ConnectionManager` owns the single `ConnectionState` value and the
//! subscription registry. Connects, reconnect bursts, reconciliation and
//! shutdown are serialized by one operation lock; state changes are applied
//! atomically through a watch channel so readers never see a torn value.

use super::state_machine::{
    ConnectionEvent, ConnectionState, ReconnectConfig, ReconnectionDecision, StateMachine,
};
use crate::observability::metrics;
use crate::subscription::{DeviceSource, SubscriptionRegistry};
use crate::transport::mqtt::{STATUS_OFFLINE, STATUS_ONLINE};
use crate::transport::{Transport, TransportError};
use rumqttc::v5::mqttbytes::QoS;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn, Instrument};

/// Connection State Machine driving a `Transport`
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    devices: Arc<dyn DeviceSource>,
    subscriptions: Mutex<SubscriptionRegistry>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    /// Serializes connect, disconnect and reconciliation
    op_lock: Mutex<()>,
    reconnect: ReconnectConfig,
    qos: QoS,
    status_topic: Option<String>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        transport: Arc<T>,
        devices: Arc<dyn DeviceSource>,
        subscriptions: SubscriptionRegistry,
        reconnect: ReconnectConfig,
        qos: QoS,
        status_topic: Option<String>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected("not started".to_string()));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            devices,
            subscriptions: Mutex::new(subscriptions),
            state_tx,
            shutdown_tx,
            op_lock: Mutex::new(()),
            reconnect,
            qos,
            status_topic,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Flips to true once shutdown begins
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Publish on the session. Refused unless the state is Connected.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if !StateMachine::can_publish(&self.state()) {
            return Err(TransportError::NotConnected);
        }
        self.transport.publish(topic, payload, qos, retain).await
    }

    /// Topic filters marked active in the registry
    pub async fn active_topics(&self) -> BTreeSet<String> {
        self.subscriptions.lock().await.active_topics()
    }

    /// All tracked topic filters, active or not
    pub async fn tracked_topics(&self) -> BTreeSet<String> {
        self.subscriptions.lock().await.tracked_topics()
    }

    /// Apply an event to the state. Returns false if the transition is not
    /// valid from the current state.
    fn apply(&self, event: ConnectionEvent) -> bool {
        let mut applied = false;
        self.state_tx.send_if_modified(|state| {
            match StateMachine::next_state(state, &event) {
                Some(next) => {
                    if *state != next {
                        StateMachine::log_state_transition(state, &next);
                    }
                    metrics().set_connection_state(next.label());
                    *state = next;
                    applied = true;
                    true
                }
                None => {
                    debug!(?event, state = ?state, "Ignoring event in current state");
                    false
                }
            }
        });
        applied
    }

    /// Initial connect. On failure the state is left Disconnected and the
    /// error returned; retries belong to `reconnect` and the health monitor.
    pub async fn start(&self) -> Result<(), TransportError> {
        let _guard = self.op_lock.lock().await;
        if !self.apply(ConnectionEvent::ConnectRequested) {
            return Ok(());
        }
        self.attempt_connect(false).await
    }

    /// Run one reconnect burst using the backoff pattern.
    ///
    /// From `Reconnecting` (after a loss) a success resubscribes every
    /// tracked topic; from `Disconnected` it reconciles against the
    /// registry. Returns the last error when the burst is exhausted.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let _guard = self.op_lock.lock().await;
        let recovering = match self.state() {
            ConnectionState::Connected | ConnectionState::ShuttingDown => return Ok(()),
            ConnectionState::Reconnecting(_) => true,
            ConnectionState::Disconnected(_) | ConnectionState::Connecting => false,
        };

        let mut attempts = 0;
        let mut last_error = TransportError::NotConnected;
        loop {
            match StateMachine::should_attempt_reconnection(
                attempts,
                &self.reconnect,
                self.is_shutdown_requested(),
            ) {
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    if attempt > 1 && !self.pause(Duration::from_millis(delay_ms)).await {
                        return Ok(());
                    }
                    let event = match self.state() {
                        ConnectionState::Reconnecting(_) => ConnectionEvent::ReconnectAttempt(attempt),
                        _ => ConnectionEvent::ConnectRequested,
                    };
                    if !self.apply(event) {
                        return Ok(());
                    }
                    attempts = attempt;
                    info!(attempt, "Reconnect attempt");
                    match self.attempt_connect(recovering).await {
                        Ok(()) => return Ok(()),
                        Err(e) => last_error = e,
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => return Ok(()),
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    warn!(attempts, "Reconnect burst exhausted: {}", last_error);
                    return Err(last_error);
                }
            }
        }
    }

    /// Sleep unless shutdown is requested first. Returns false on shutdown.
    async fn pause(&self, delay: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_shutdown_requested(),
            _ = shutdown_rx.changed() => false,
        }
    }

    /// One connect attempt plus the subscribe pass. Caller holds `op_lock`.
    async fn attempt_connect(&self, recovering: bool) -> Result<(), TransportError> {
        metrics().mqtt_connection_attempt();
        let span = crate::mqtt_span!(operation = "connect", recovering);
        if let Err(e) = self.transport.connect().instrument(span).await {
            metrics().mqtt_connection_failed();
            warn!("Connect failed: {}", e);
            self.apply(ConnectionEvent::ConnectFailed(e.to_string()));
            return Err(e);
        }
        if !self.apply(ConnectionEvent::ConnAckReceived) {
            // Shutdown raced the connect; leave the session for shutdown().
            return Ok(());
        }
        metrics().mqtt_connection_established();

        if recovering {
            self.resubscribe_tracked().await;
        } else {
            self.reconcile_and_apply().await;
        }

        // A loss reported before ConnAck was applied is ignored by the state
        // machine, so the session itself is the authority here.
        if !self.transport.is_connected() {
            if self.is_shutdown_requested() {
                return Ok(());
            }
            self.handle_connection_lost("session closed during connect");
            return Err(TransportError::NotConnected);
        }
        self.publish_status(STATUS_ONLINE).await;
        Ok(())
    }

    /// Mark an abnormal session loss. Subscriptions stay tracked.
    pub fn handle_connection_lost(&self, reason: &str) {
        if self.apply(ConnectionEvent::ConnectionLost(reason.to_string())) {
            metrics().mqtt_connection_lost();
            warn!(%reason, "Broker session lost");
        }
    }

    /// Reconcile against the registry and apply the delta while connected
    pub async fn refresh_subscriptions(&self) {
        let _guard = self.op_lock.lock().await;
        if self.is_connected() {
            self.reconcile_and_apply().await;
        }
    }

    /// Subscribe a single filter and pin it in the registry, so later
    /// reconciliation passes keep it even when no device maps to it. A
    /// filter already active is a no-op without a broker round-trip.
    pub async fn subscribe_topic(&self, topic: &str) -> Result<(), TransportError> {
        let mut registry = self.subscriptions.lock().await;
        if !StateMachine::can_subscribe(&self.state()) {
            return Err(TransportError::NotConnected);
        }
        if registry.is_active(topic) {
            debug!(%topic, "Subscription already active");
            return Ok(());
        }
        registry.track(topic);
        let result = self.transport.subscribe(topic, self.qos).await;
        match &result {
            Ok(()) => {
                registry.mark_active(topic);
            }
            Err(e) => {
                registry.mark_inactive(topic);
                metrics().subscribe_failed();
                warn!(%topic, "Subscribe failed: {}", e);
            }
        }
        metrics().set_subscriptions_active(registry.active_topics().len());
        result
    }

    async fn reconcile_and_apply(&self) {
        let mut registry = self.subscriptions.lock().await;
        match self.devices.device_ids().await {
            Ok(device_ids) => {
                let delta = registry.reconcile(&device_ids);
                if !delta.is_empty() {
                    info!(
                        added = delta.added.len(),
                        removed = delta.removed.len(),
                        devices = device_ids.len(),
                        "Subscription set changed"
                    );
                }
                for topic in &delta.removed {
                    if let Err(e) = self.transport.unsubscribe(topic).await {
                        warn!(%topic, "Unsubscribe failed: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!("Device registry unavailable, keeping current subscriptions: {}", e);
            }
        }
        let pending = registry.inactive_topics();
        self.subscribe_all(&mut registry, pending).await;
    }

    async fn resubscribe_tracked(&self) {
        let mut registry = self.subscriptions.lock().await;
        let tracked = registry.tracked_topics();
        info!(topics = tracked.len(), "Restoring subscriptions");
        self.subscribe_all(&mut registry, tracked).await;
    }

    /// Subscribe each filter in order; failures stay inactive for the next pass
    async fn subscribe_all(&self, registry: &mut SubscriptionRegistry, topics: BTreeSet<String>) {
        for topic in topics {
            if !StateMachine::can_subscribe(&self.state()) {
                debug!("Stopping subscribe pass, session no longer connected");
                break;
            }
            match self.transport.subscribe(&topic, self.qos).await {
                Ok(()) => {
                    registry.mark_active(&topic);
                }
                Err(e) => {
                    registry.mark_inactive(&topic);
                    metrics().subscribe_failed();
                    warn!(%topic, "Subscribe failed: {}", e);
                }
            }
        }
        metrics().set_subscriptions_active(registry.active_topics().len());
    }

    async fn publish_status(&self, status: &str) {
        let Some(topic) = &self.status_topic else {
            return;
        };
        match self
            .transport
            .publish(topic, status.as_bytes().to_vec(), QoS::AtLeastOnce, true)
            .await
        {
            Ok(()) => debug!(%topic, %status, "Published status marker"),
            Err(e) => warn!(%topic, %status, "Status marker not published: {}", e),
        }
    }

    /// Enter ShuttingDown. Interrupts reconnect backoff and publishes the
    /// offline marker while the session is still up.
    pub async fn begin_shutdown(&self) {
        let was_connected = self.is_connected();
        self.shutdown_tx.send_replace(true);
        if !self.apply(ConnectionEvent::ShutdownRequested) {
            return;
        }
        if was_connected && self.transport.is_connected() {
            self.publish_status(STATUS_OFFLINE).await;
        }
    }

    /// Full shutdown: ShuttingDown, offline marker, then disconnect
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.begin_shutdown().await;
        let _guard = self.op_lock.lock().await;
        self.transport.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriptionMode;
    use crate::testing::mocks::{MockTransport, StaticDeviceSource};

    fn manager(
        transport: Arc<MockTransport>,
        devices: Arc<StaticDeviceSource>,
        mode: SubscriptionMode,
    ) -> ConnectionManager<MockTransport> {
        ConnectionManager::new(
            transport,
            devices,
            SubscriptionRegistry::new(mode, "bms/telemetry", &[]),
            ReconnectConfig {
                max_attempts: Some(5),
                backoff_pattern: vec![1, 1, 1],
                sustained_delay: 1,
            },
            QoS::AtLeastOnce,
            Some("ingestor/status".to_string()),
        )
    }

    #[tokio::test]
    async fn test_start_subscribes_registry_devices() {
        // Arrange
        let transport = Arc::new(MockTransport::new());
        let devices = Arc::new(StaticDeviceSource::new(["PACK001", "PACK002"]));
        let manager = manager(transport.clone(), devices, SubscriptionMode::PerDevice);

        // Act
        manager.start().await.unwrap();

        // Assert
        assert_eq!(manager.state(), ConnectionState::Connected);
        let active = manager.active_topics().await;
        assert!(active.contains("bms/telemetry/PACK001"));
        assert!(active.contains("bms/telemetry/PACK002"));
        assert_eq!(transport.subscribe_calls().len(), 2);
        let published = transport.published();
        assert_eq!(published.last().map(|p| p.payload.as_slice()), Some(&b"online"[..]));
        assert!(published.last().is_some_and(|p| p.retain));
    }

    #[tokio::test]
    async fn test_wildcard_mode_uses_single_filter() {
        let transport = Arc::new(MockTransport::new());
        let devices = Arc::new(StaticDeviceSource::new(["PACK001", "PACK002", "PACK003"]));
        let manager = manager(transport.clone(), devices, SubscriptionMode::Wildcard);

        manager.start().await.unwrap();

        let expected: BTreeSet<String> = ["bms/telemetry/#".to_string()].into();
        assert_eq!(manager.active_topics().await, expected);
    }

    #[tokio::test]
    async fn test_failed_start_leaves_disconnected() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_connects(1);
        let devices = Arc::new(StaticDeviceSource::new(["PACK001"]));
        let manager = manager(transport.clone(), devices, SubscriptionMode::PerDevice);

        let result = manager.start().await;

        assert!(result.is_err());
        assert!(matches!(manager.state(), ConnectionState::Disconnected(_)));
        assert!(transport.subscribe_calls().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_applies_registry_changes() {
        let transport = Arc::new(MockTransport::new());
        let devices = Arc::new(StaticDeviceSource::new(["PACK001", "PACK002"]));
        let manager = manager(transport.clone(), devices.clone(), SubscriptionMode::PerDevice);
        manager.start().await.unwrap();

        devices.set_ids(["PACK002", "PACK003"]);
        manager.refresh_subscriptions().await;

        let active = manager.active_topics().await;
        assert!(!active.contains("bms/telemetry/PACK001"));
        assert!(active.contains("bms/telemetry/PACK003"));
        assert_eq!(transport.unsubscribe_calls(), vec!["bms/telemetry/PACK001".to_string()]);
    }

    #[tokio::test]
    async fn test_registry_outage_keeps_subscriptions() {
        let transport = Arc::new(MockTransport::new());
        let devices = Arc::new(StaticDeviceSource::new(["PACK001"]));
        let manager = manager(transport.clone(), devices.clone(), SubscriptionMode::PerDevice);
        manager.start().await.unwrap();
        let before = manager.active_topics().await;

        devices.set_unavailable(true);
        manager.refresh_subscriptions().await;

        assert_eq!(manager.active_topics().await, before);
        assert!(transport.unsubscribe_calls().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_rejected_when_not_connected() {
        let transport = Arc::new(MockTransport::new());
        let devices = Arc::new(StaticDeviceSource::new(Vec::<String>::new()));
        let manager = manager(transport.clone(), devices, SubscriptionMode::PerDevice);

        let result = manager.subscribe_topic("bms/telemetry/PACK001").await;

        assert_eq!(result, Err(TransportError::NotConnected));
        assert!(transport.subscribe_calls().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_publishes_offline_and_is_terminal() {
        let transport = Arc::new(MockTransport::new());
        let devices = Arc::new(StaticDeviceSource::new(["PACK001"]));
        let manager = manager(transport.clone(), devices, SubscriptionMode::PerDevice);
        manager.start().await.unwrap();

        manager.shutdown().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::ShuttingDown);
        let published = transport.published();
        assert_eq!(published.last().map(|p| p.payload.as_slice()), Some(&b"offline"[..]));
        assert!(!transport.is_connected());

        // No reconnect once shutting down
        manager.reconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::ShuttingDown);
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_manual_subscription_survives_refresh() {
        let transport = Arc::new(MockTransport::new());
        let devices = Arc::new(StaticDeviceSource::new(["PACK001"]));
        let manager = manager(transport.clone(), devices.clone(), SubscriptionMode::PerDevice);
        manager.start().await.unwrap();

        manager.subscribe_topic("bms/alerts/#").await.unwrap();
        devices.set_ids(["PACK002"]);
        manager.refresh_subscriptions().await;

        let active = manager.active_topics().await;
        assert!(active.contains("bms/alerts/#"));
        assert!(active.contains("bms/telemetry/PACK002"));
        assert_eq!(transport.unsubscribe_calls(), vec!["bms/telemetry/PACK001".to_string()]);
        assert!(transport.session_filters().contains("bms/alerts/#"));
    }

    #[tokio::test]
    async fn test_session_lost_during_connect_is_not_reported_connected() {
        let transport = Arc::new(MockTransport::new());
        transport.drop_session_after_next_connects(1);
        let devices = Arc::new(StaticDeviceSource::new(["PACK001"]));
        let manager = manager(transport.clone(), devices, SubscriptionMode::PerDevice);

        let result = manager.start().await;

        assert_eq!(result, Err(TransportError::NotConnected));
        assert_eq!(manager.state(), ConnectionState::Reconnecting(0));
        assert!(manager.active_topics().await.is_empty());
        assert!(manager.tracked_topics().await.contains("bms/telemetry/PACK001"));
        assert!(transport.published().is_empty());

        manager.reconnect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.connect_attempts(), 2);
        let expected: BTreeSet<String> = ["bms/telemetry/PACK001".to_string()].into();
        assert_eq!(transport.session_filters(), expected);
        assert_eq!(manager.active_topics().await, expected);
    }

    #[tokio::test]
    async fn test_burst_retries_when_session_drops_after_connack() {
        let transport = Arc::new(MockTransport::new());
        transport.drop_session_after_next_connects(2);
        let devices = Arc::new(StaticDeviceSource::new(["PACK001", "PACK002"]));
        let manager = manager(transport.clone(), devices, SubscriptionMode::PerDevice);

        manager.reconnect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.connect_attempts(), 3);
        assert_eq!(transport.session_filters().len(), 2);
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload, b"online".to_vec());
    }

    #[tokio::test]
    async fn test_burst_gives_up_after_max_attempts() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_connects(10);
        let devices = Arc::new(StaticDeviceSource::new(["PACK001"]));
        let manager = manager(transport.clone(), devices, SubscriptionMode::PerDevice);

        let result = manager.reconnect().await;

        assert!(result.is_err());
        assert_eq!(transport.connect_attempts(), 5);
        assert!(!manager.state().is_shutting_down());
    }
}
