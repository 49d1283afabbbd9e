//! Input decoding, object and queue access, output publishing

pub mod goes_reader;
pub mod object_store;
pub mod queue;
pub mod publisher;
pub mod retention;

// Re-export main types
pub use goes_reader::{to_physical, GoesHeader, GoesReader};
pub use object_store::{FetchedObject, HttpObjectStore, ObjectStore, ObjectSummary};
pub use queue::{parse_message_body, JobQueue, QueueMessage, SqsQueue};
pub use publisher::{filename_for_key, read_provenance, PublishOutcome, Publisher, RecencyIndex};
pub use retention::{RetentionSweeper, SweepReport};
