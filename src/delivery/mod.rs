//! Entry points that discover units of work and drive the pipeline

pub mod queue_consumer;
pub mod poller;

pub use queue_consumer::{ConsumerParams, Disposition, DrainSummary, LeaseHandle, QueueConsumer};
pub use poller::{LockMarker, PollSummary, Poller};

use crate::io::retention::SweepReport;
use crate::types::{GvResult, SourceRef};
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Result of one successful pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Published(PathBuf),
    /// Skipped because an equivalent output already exists
    AlreadyPublished(String),
}

/// Full ingest-to-publish processing of one source object.
///
/// Implementations block; the queue consumer runs them on the blocking pool.
pub trait UnitProcessor: Send + Sync + 'static {
    fn process(&self, unit: &SourceRef) -> GvResult<Outcome>;

    /// Delete expired outputs
    fn sweep_expired(&self, _now: DateTime<Utc>) -> GvResult<SweepReport> {
        Ok(SweepReport::default())
    }
}

/// Keys outside the configured product prefix are not work for this process
pub fn is_eligible(unit: &SourceRef, prefix: &str) -> bool {
    unit.key.starts_with(prefix)
}
