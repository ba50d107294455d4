pub mod model;
pub mod payload;
pub mod queue;
pub mod repo;
pub mod retry;
pub mod runner;

pub use model::{Job, JobCounts, JobStatus, NewJob};
pub use payload::{DecodeError, JobPayload};
pub use queue::{FailOutcome, JobQueue};
pub use repo::PgJobQueue;
pub use runner::{JobRunner, Settlement};
