//! Health Monitor
//!
//! One periodic loop. While the session is down it waits `reconnect_wait`
//! and starts a reconnect burst; while it is up it refreshes subscriptions,
//! runs a snapshot publish cycle and emits a liveness signal. Outside of
//! startup this is the only caller of `reconnect`; other components ask for
//! an early pass through `waker()`.

use super::manager::ConnectionManager;
use super::state_machine::ConnectionState;
use crate::observability::metrics;
use crate::outbound::OutboundPublisher;
use crate::storage::DeviceRegistry;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one monitor pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Reconnected,
    ReconnectFailed,
    Published { successes: usize, failures: usize },
    Idle,
}

pub struct HealthMonitor<T: Transport> {
    manager: Arc<ConnectionManager<T>>,
    publisher: Arc<OutboundPublisher<T>>,
    registry: DeviceRegistry,
    interval: Duration,
    reconnect_wait: Duration,
    wake: Arc<Notify>,
}

impl<T: Transport + 'static> HealthMonitor<T> {
    pub fn new(
        manager: Arc<ConnectionManager<T>>,
        publisher: Arc<OutboundPublisher<T>>,
        registry: DeviceRegistry,
        interval: Duration,
        reconnect_wait: Duration,
    ) -> Self {
        Self {
            manager,
            publisher,
            registry,
            interval,
            reconnect_wait,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Notifying this runs a pass immediately instead of at the next tick
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown is requested
    pub async fn run(self) {
        let mut shutdown = self.manager.shutdown_signal();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already connected.
        ticker.tick().await;

        info!(interval_secs = self.interval.as_secs(), "Health monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {
                    debug!("Health check requested early");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if self.manager.is_shutdown_requested() {
                break;
            }
            let action = self.check().await;
            debug!(?action, "Health check complete");
        }
        info!("Health monitor stopped");
    }

    /// One monitor pass
    pub async fn check(&self) -> MonitorAction {
        // A session closed without a Disconnected event still counts as down
        if self.manager.is_connected() && !self.manager.transport().is_connected() {
            self.manager
                .handle_connection_lost("session closed without a disconnect event");
        }
        match self.manager.state() {
            ConnectionState::ShuttingDown => MonitorAction::Idle,
            ConnectionState::Connected => {
                self.manager.refresh_subscriptions().await;
                let attempts = self.publisher.publish_cycle(&self.registry).await;
                let successes = attempts.iter().filter(|a| a.succeeded()).count();
                metrics().heartbeat();
                let subscriptions = self.manager.active_topics().await.len();
                info!(state = "connected", subscriptions, "Ingestor alive");
                MonitorAction::Published {
                    successes,
                    failures: attempts.len() - successes,
                }
            }
            state => {
                warn!(
                    state = state.label(),
                    wait_ms = self.reconnect_wait.as_millis() as u64,
                    "Session down, reconnecting"
                );
                if !self.wait_before_reconnect().await {
                    return MonitorAction::Idle;
                }
                match self.manager.reconnect().await {
                    Ok(()) if self.manager.is_connected() => MonitorAction::Reconnected,
                    Ok(()) => MonitorAction::Idle,
                    Err(_) => MonitorAction::ReconnectFailed,
                }
            }
        }
    }

    /// Returns false if shutdown began during the wait
    async fn wait_before_reconnect(&self) -> bool {
        let mut shutdown = self.manager.shutdown_signal();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.reconnect_wait) => !self.manager.is_shutdown_requested(),
            _ = shutdown.changed() => false,
        }
    }
}
