//! Read model handed to the presentation layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::scheduler::job::{
    FailureRecord, Job, JobId, JobParams, JobPriority, JobStatus, JobType, WorkerId,
};
use crate::state::ClusterState;
use crate::stats::ClusterStats;
use crate::worker::probe::ResourceSnapshot;
use crate::worker::registry::{Worker, WorkerHealth};

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub name: String,
    pub job_type: JobType,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub params: JobParams,
    pub attempts: u32,
    pub assigned_worker: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub age_ms: u64,
    pub run_time_ms: Option<u64>,
    pub error: Option<String>,
    pub failures: Vec<FailureRecord>,
}

impl JobView {
    pub fn from_job(job: &Job, now: Instant) -> Self {
        let run_time_ms = job.started_at.map(|started| {
            job.completed_at
                .unwrap_or(now)
                .saturating_duration_since(started)
                .as_millis() as u64
        });
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            job_type: job.job_type(),
            priority: job.priority,
            status: job.status,
            params: job.params.clone(),
            attempts: job.attempts,
            assigned_worker: job.assigned_worker.clone(),
            created_at: job.created_at,
            age_ms: now.saturating_duration_since(job.created).as_millis() as u64,
            run_time_ms,
            error: job.error.clone(),
            failures: job.failures.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub id: WorkerId,
    pub health: WorkerHealth,
    pub failure_rate: f64,
    pub current_job: Option<JobId>,
    pub is_available: bool,
    pub since_heartbeat_ms: u64,
    pub failure_count: u64,
    pub recovery_count: u64,
    pub recovers_in_ms: Option<u64>,
    pub resources: Option<ResourceSnapshot>,
}

impl WorkerView {
    pub fn from_worker(worker: &Worker, now: Instant) -> Self {
        Self {
            id: worker.id.clone(),
            health: worker.health,
            failure_rate: worker.failure_rate,
            current_job: worker.current_job.clone(),
            is_available: worker.is_available(),
            since_heartbeat_ms: now.saturating_duration_since(worker.last_heartbeat).as_millis()
                as u64,
            failure_count: worker.failure_count,
            recovery_count: worker.recovery_count,
            recovers_in_ms: worker
                .recover_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            resources: worker.resources.as_deref().cloned(),
        }
    }
}

/// Everything the dashboard shows, captured under one read lock.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    pub job_rate_per_minute: f64,
    pub queue: Vec<JobId>,
    pub jobs: Vec<JobView>,
    pub workers: Vec<WorkerView>,
    pub stats: ClusterStats,
}

impl ClusterSnapshot {
    pub fn capture(state: &ClusterState, job_rate_per_minute: f64, now: Instant) -> Self {
        Self {
            job_rate_per_minute,
            queue: state.queue().ids_in_order(),
            jobs: state
                .jobs()
                .into_iter()
                .map(|j| JobView::from_job(j, now))
                .collect(),
            workers: state
                .workers()
                .all()
                .map(|w| WorkerView::from_worker(w, now))
                .collect(),
            stats: ClusterStats::collect(state, now),
        }
    }
}
