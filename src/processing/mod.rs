//! Inbound message processing
//!
//! `classifier` turns one broker message into a record or a drop reason;
//! `pipeline` runs classification and storage on a bounded worker pool.

pub mod classifier;
pub mod pipeline;

pub use classifier::Classifier;
pub use pipeline::{
    process_message, IngestPipeline, MessageOutcome, PipelineHandle, PipelineStats,
    PipelineSummary,
};
