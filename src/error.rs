use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    #[error("Job queue is empty")]
    EmptyQueue,

    #[error("Resource probe unavailable for worker {0}")]
    ProbeUnavailable(String),

    #[error("Worker {0} failed")]
    WorkerFailed(String),

    #[error("Job {0} exceeded its deadline")]
    JobTimeout(String),

    #[error("Job {0} exceeded the retry limit of {1}")]
    RetryLimitExceeded(String, u32),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Job queue is at capacity")]
    QueueFull,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Stale report for job {0}")]
    StaleReport(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl SimError {
    /// Only a broken internal invariant is allowed to stop the orchestrator.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SimError::InvariantViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
