//! Durable job queue: Job Store, Queue Index, Queue Metadata, and the Queue Driver
//! that reconciles them under a `FOR UPDATE SKIP LOCKED` claim protocol.

pub mod error;
pub mod queue;
pub mod store;
pub mod tag;

pub use error::QueueError;
pub use queue::{register_migrations, ClaimedJob, InitPolicy, QueueDriver, RecoveryConfig};
pub use store::{Job, JobStatus};
pub use tag::{decode_tagged, encode_tagged};
