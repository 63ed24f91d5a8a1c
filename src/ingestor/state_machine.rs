//! Pure connection state transitions and reconnect decisions
//!
//! This module contains pure functions only; `ConnectionManager` owns the
//! single state value and applies the transitions computed here.

use crate::config::ReconnectSection;
use tracing::{error, info, warn};

/// Connection state of the ingestor's broker session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not connected, with the reason
    Disconnected(String),
    /// First connect in flight
    Connecting,
    /// Acknowledged by the broker; publish/subscribe allowed
    Connected,
    /// Recovering an abnormal loss (attempt count within the burst)
    Reconnecting(u32),
    /// Terminal
    ShuttingDown,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting(_) => "reconnecting",
            ConnectionState::ShuttingDown => "shutting_down",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(self, ConnectionState::ShuttingDown)
    }
}

/// Events that drive state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// start() or a health-monitor retry from Disconnected
    ConnectRequested,
    /// Broker acknowledged the connect
    ConnAckReceived,
    /// Connect attempt failed (network, auth or TLS)
    ConnectFailed(String),
    /// Abnormal disconnect of an established session
    ConnectionLost(String),
    /// Another attempt within a reconnect burst
    ReconnectAttempt(u32),
    /// Explicit stop request
    ShutdownRequested,
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Attempts per burst (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_pattern_ms.clone(),
            sustained_delay: section.sustained_delay_ms,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay before the given (1-based) attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - burst exhausted
    AbortMaxAttemptsExceeded,
}

/// Pure transition logic
pub struct StateMachine;

impl StateMachine {
    /// Next state for an event, or None when the event is not valid in the
    /// current state. ShuttingDown is terminal.
    pub fn next_state(current: &ConnectionState, event: &ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (current, event) {
            (S::ShuttingDown, _) => None,
            (_, E::ShutdownRequested) => Some(S::ShuttingDown),
            (S::Disconnected(_), E::ConnectRequested) => Some(S::Connecting),
            (S::Connecting | S::Reconnecting(_), E::ConnAckReceived) => Some(S::Connected),
            (S::Connecting, E::ConnectFailed(reason)) => Some(S::Disconnected(reason.clone())),
            (S::Reconnecting(attempt), E::ConnectFailed(_)) => Some(S::Reconnecting(*attempt)),
            (S::Reconnecting(_), E::ReconnectAttempt(attempt)) => Some(S::Reconnecting(*attempt)),
            (S::Connected, E::ConnectionLost(_)) => Some(S::Reconnecting(0)),
            _ => None,
        }
    }

    /// Determine if another attempt in the current burst should be made
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }
        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: config.calculate_backoff_delay(current_attempts + 1),
        }
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    pub fn can_subscribe(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting(_)) => {
                warn!("MQTT connection lost, reconnecting");
            }
            (ConnectionState::Connecting, ConnectionState::Disconnected(reason)) => {
                error!("MQTT connect failed: {}", reason);
            }
            (_, ConnectionState::ShuttingDown) => {
                info!("Connection shutting down");
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disconnected() -> ConnectionState {
        ConnectionState::Disconnected("initial".to_string())
    }

    #[test]
    fn test_happy_path_transitions() {
        let connecting =
            StateMachine::next_state(&disconnected(), &ConnectionEvent::ConnectRequested).unwrap();
        assert_eq!(connecting, ConnectionState::Connecting);

        let connected =
            StateMachine::next_state(&connecting, &ConnectionEvent::ConnAckReceived).unwrap();
        assert_eq!(connected, ConnectionState::Connected);
    }

    #[test]
    fn test_connect_failure_returns_to_disconnected() {
        let next = StateMachine::next_state(
            &ConnectionState::Connecting,
            &ConnectionEvent::ConnectFailed("refused".to_string()),
        );
        assert_eq!(next, Some(ConnectionState::Disconnected("refused".to_string())));
    }

    #[test]
    fn test_loss_and_recovery() {
        let lost = StateMachine::next_state(
            &ConnectionState::Connected,
            &ConnectionEvent::ConnectionLost("keepalive".to_string()),
        )
        .unwrap();
        assert_eq!(lost, ConnectionState::Reconnecting(0));

        let retrying =
            StateMachine::next_state(&lost, &ConnectionEvent::ReconnectAttempt(2)).unwrap();
        assert_eq!(retrying, ConnectionState::Reconnecting(2));

        let still = StateMachine::next_state(
            &retrying,
            &ConnectionEvent::ConnectFailed("refused".to_string()),
        );
        assert_eq!(still, Some(ConnectionState::Reconnecting(2)));

        let back = StateMachine::next_state(&retrying, &ConnectionEvent::ConnAckReceived);
        assert_eq!(back, Some(ConnectionState::Connected));
    }

    #[test]
    fn test_shutdown_from_any_state_is_terminal() {
        for state in [
            disconnected(),
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting(3),
        ] {
            assert_eq!(
                StateMachine::next_state(&state, &ConnectionEvent::ShutdownRequested),
                Some(ConnectionState::ShuttingDown)
            );
        }
        assert_eq!(
            StateMachine::next_state(&ConnectionState::ShuttingDown, &ConnectionEvent::ConnectRequested),
            None
        );
        assert_eq!(
            StateMachine::next_state(&ConnectionState::ShuttingDown, &ConnectionEvent::ConnAckReceived),
            None
        );
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert_eq!(
            StateMachine::next_state(&ConnectionState::Connected, &ConnectionEvent::ConnectRequested),
            None
        );
        assert_eq!(
            StateMachine::next_state(&disconnected(), &ConnectionEvent::ConnAckReceived),
            None
        );
        assert_eq!(
            StateMachine::next_state(
                &disconnected(),
                &ConnectionEvent::ConnectionLost("x".to_string())
            ),
            None
        );
        assert_eq!(
            StateMachine::next_state(&disconnected(), &ConnectionEvent::ReconnectAttempt(1)),
            None
        );
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            backoff_pattern: vec![10, 20],
            sustained_delay: 50,
        };

        assert_eq!(
            StateMachine::should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed { attempt: 1, delay_ms: 10 }
        );
        assert_eq!(
            StateMachine::should_attempt_reconnection(2, &config, false),
            ReconnectionDecision::Proceed { attempt: 3, delay_ms: 50 }
        );
        assert_eq!(
            StateMachine::should_attempt_reconnection(3, &config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
        assert_eq!(
            StateMachine::should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_unlimited_attempts_sustain_delay() {
        let config = ReconnectConfig {
            max_attempts: None,
            backoff_pattern: vec![],
            sustained_delay: 250,
        };
        assert_eq!(
            StateMachine::should_attempt_reconnection(1000, &config, false),
            ReconnectionDecision::Proceed { attempt: 1001, delay_ms: 250 }
        );
    }

    #[test]
    fn test_gating_only_when_connected() {
        assert!(StateMachine::can_publish(&ConnectionState::Connected));
        assert!(StateMachine::can_subscribe(&ConnectionState::Connected));
        assert!(!StateMachine::can_publish(&ConnectionState::Reconnecting(1)));
        assert!(!StateMachine::can_subscribe(&ConnectionState::ShuttingDown));
        assert!(!StateMachine::can_publish(&disconnected()));
    }

    #[test]
    fn test_reconnect_config_from_section() {
        let config = ReconnectConfig::from(&ReconnectSection::default());
        assert_eq!(config.max_attempts, Some(5));
        assert_eq!(config.calculate_backoff_delay(1), 1000);
        assert_eq!(config.calculate_backoff_delay(4), 10000);
        assert_eq!(config.calculate_backoff_delay(9), 30000);
    }
}
