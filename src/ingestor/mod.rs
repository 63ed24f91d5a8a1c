//! Connection lifecycle for the ingestor
//!
//! - [`state_machine`] - pure transition table and reconnect policy
//! - [`manager`] - the Connection State Machine driving a `Transport`
//! - [`health_monitor`] - periodic liveness, reconnect and publish loop
//! - [`lifecycle`] - wires everything into a running `Ingestor`

pub mod health_monitor;
pub mod lifecycle;
pub mod manager;
pub mod state_machine;

pub use health_monitor::{HealthMonitor, MonitorAction};
pub use lifecycle::{storage_report, wait_for_state, Ingestor, StorageReport};
pub use manager::ConnectionManager;
pub use state_machine::{ConnectionEvent, ConnectionState, ReconnectConfig, StateMachine};
