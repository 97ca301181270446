pub mod dispatcher;
pub mod generator;
pub mod job;
pub mod queue;

pub use dispatcher::{Dispatcher, SelectionPolicy};
pub use generator::JobGenerator;
pub use job::{FailureReason, Job, JobId, JobParams, JobPriority, JobSpec, JobStatus, JobType};
pub use queue::JobQueue;
