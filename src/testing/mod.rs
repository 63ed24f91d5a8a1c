//! Testing utilities and mock implementations
//!
//! Mock broker, storage and registry collaborators for exercising the
//! ingestor without external services.

pub mod mocks;

pub use mocks::*;
