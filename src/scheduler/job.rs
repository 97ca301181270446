use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Result, SimError};

pub type JobId = String;
pub type WorkerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Sleep,
    Compute,
    Matrix,
    FaultInjection,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Sleep => write!(f, "sleep"),
            JobType::Compute => write!(f, "compute"),
            JobType::Matrix => write!(f, "matrix"),
            JobType::FaultInjection => write!(f, "fault_injection"),
        }
    }
}

/// Dispatch priority. Declaration order is the dispatch order, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::Low => write!(f, "low"),
            JobPriority::Normal => write!(f, "normal"),
            JobPriority::High => write!(f, "high"),
            JobPriority::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Abandoned,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Abandoned)
    }

    /// Legal moves of the job lifecycle.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Pending)
                | (Failed, Abandoned)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Why a running attempt ended without completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    /// The worker crashed (random draw or forced).
    WorkerCrashed,
    /// The worker stopped heartbeating and was declared failed.
    HeartbeatLost,
    /// The job outlived its deadline.
    Timeout,
    /// The job handler reported an error.
    ExecutionError(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::WorkerCrashed => write!(f, "worker crashed"),
            FailureReason::HeartbeatLost => write!(f, "heartbeat lost"),
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::ExecutionError(msg) => write!(f, "execution error: {}", msg),
        }
    }
}

/// Type-specific job parameters, drawn when the job is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobParams {
    Sleep {
        duration_ms: u64,
    },
    Compute {
        iterations: u64,
    },
    Matrix {
        matrix_size: u64,
    },
    FaultInjection {
        failure_probability: f64,
        duration_ms: u64,
    },
}

impl JobParams {
    pub fn job_type(&self) -> JobType {
        match self {
            JobParams::Sleep { .. } => JobType::Sleep,
            JobParams::Compute { .. } => JobType::Compute,
            JobParams::Matrix { .. } => JobType::Matrix,
            JobParams::FaultInjection { .. } => JobType::FaultInjection,
        }
    }
}

/// A job that has not been admitted to the job table yet.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub priority: JobPriority,
    pub params: JobParams,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, priority: JobPriority, params: JobParams) -> Self {
        Self {
            name: name.into(),
            priority,
            params,
        }
    }

    pub fn sleep(duration: Duration, priority: JobPriority) -> Self {
        Self::new(
            "sleep-job",
            priority,
            JobParams::Sleep {
                duration_ms: duration.as_millis() as u64,
            },
        )
    }

    pub fn compute(iterations: u64, priority: JobPriority) -> Self {
        Self::new("compute-job", priority, JobParams::Compute { iterations })
    }

    pub fn matrix(matrix_size: u64, priority: JobPriority) -> Self {
        Self::new("matrix-job", priority, JobParams::Matrix { matrix_size })
    }

    pub fn fault_injection(
        failure_probability: f64,
        duration: Duration,
        priority: JobPriority,
    ) -> Self {
        Self::new(
            "fault-injection-job",
            priority,
            JobParams::FaultInjection {
                failure_probability,
                duration_ms: duration.as_millis() as u64,
            },
        )
    }

    pub fn job_type(&self) -> JobType {
        self.params.job_type()
    }
}

/// One failed attempt in a job's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub attempt: u32,
    pub worker_id: Option<WorkerId>,
    pub reason: FailureReason,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub priority: JobPriority,
    pub params: JobParams,
    pub status: JobStatus,
    /// Creation order, used to keep the queue stable within a priority.
    pub seq: u64,
    /// Starts at 1 and grows by one on every failed attempt.
    pub attempts: u32,
    pub assigned_worker: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub created: Instant,
    pub deadline: Instant,
    pub started_at: Option<Instant>,
    /// Start of the first attempt; kept across retries.
    pub first_started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub error: Option<String>,
    pub failures: Vec<FailureRecord>,
}

impl Job {
    pub fn new(id: JobId, seq: u64, spec: JobSpec, now: Instant, timeout: Duration) -> Self {
        Self {
            id,
            name: spec.name,
            priority: spec.priority,
            params: spec.params,
            status: JobStatus::Pending,
            seq,
            attempts: 1,
            assigned_worker: None,
            created_at: Utc::now(),
            created: now,
            deadline: now + timeout,
            started_at: None,
            first_started_at: None,
            completed_at: None,
            error: None,
            failures: Vec::new(),
        }
    }

    pub fn job_type(&self) -> JobType {
        self.params.job_type()
    }

    pub fn last_failure(&self) -> Option<&FailureRecord> {
        self.failures.last()
    }

    /// Time from creation to completion.
    pub fn latency(&self) -> Option<Duration> {
        self.completed_at
            .filter(|_| self.status == JobStatus::Completed)
            .map(|done| done.saturating_duration_since(self.created))
    }

    /// Time from the first dispatch to completion, retries included.
    pub fn turnaround(&self) -> Option<Duration> {
        let first = self.first_started_at?;
        self.completed_at
            .filter(|_| self.status == JobStatus::Completed)
            .map(|done| done.saturating_duration_since(first))
    }

    /// Fail with an invariant violation unless `self.status -> next` is legal.
    pub fn ensure_transition(&self, next: JobStatus) -> Result<()> {
        if self.status.can_transition_to(next) {
            return Ok(());
        }
        Err(SimError::InvariantViolation(format!(
            "job {} cannot move from {} to {}",
            self.id, self.status, next
        )))
    }
}
