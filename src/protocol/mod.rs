//! Message types, topic rules and timestamp policy for BMS ingestion
//!
//! Everything in this module is pure: no I/O, no shared state.

pub mod messages;
pub mod timestamps;
pub mod topics;

pub use messages::*;
pub use topics::*;
