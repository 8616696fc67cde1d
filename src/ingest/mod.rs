//! Background ingestion of completed exchanges

pub mod pipeline;
pub mod queue;

pub use pipeline::{Exchange, IngestPipeline, IngestReport};
pub use queue::{IngestQueue, IngestWorkers};
