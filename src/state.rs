//! Shared mutable state of the simulated cluster.
//!
//! The job table, the pending queue and the worker registry live together in
//! one [`ClusterState`] that callers guard with a single lock. Every status
//! change, health transition and assignment is one method call on it, so a
//! worker failure and a completion report for the same job can never
//! interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{validate_failure_rate, SimConfig};
use crate::error::{Result, SimError};
use crate::events::{ClusterEvent, EventSink};
use crate::rng::SimRng;
use crate::scheduler::job::{
    FailureReason, FailureRecord, Job, JobId, JobParams, JobSpec, JobStatus, WorkerId,
};
use crate::scheduler::queue::JobQueue;
use crate::stats::StatsLedger;
use crate::worker::probe::ResourceSnapshot;
use crate::worker::registry::{HeartbeatOutcome, WorkerHealth, WorkerRegistry};

/// Work handed to an execution unit.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub attempt: u32,
    pub params: JobParams,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

/// Identifies one failure of one job, so it is recovered at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecoveryTicket {
    pub job_id: JobId,
    /// Number of failures recorded on the job when the ticket was issued.
    pub failure_index: usize,
}

pub struct ClusterState {
    jobs: HashMap<JobId, Job>,
    queue: JobQueue,
    workers: WorkerRegistry,
    running: HashMap<JobId, CancellationToken>,
    ledger: StatsLedger,
    next_seq: u64,
    job_timeout: Duration,
    recovery_delay: (Duration, Duration),
    rng: SimRng,
    sink: Arc<dyn EventSink>,
    started: Instant,
}

impl ClusterState {
    pub fn new(config: &SimConfig, rng: SimRng, sink: Arc<dyn EventSink>) -> Self {
        Self {
            jobs: HashMap::new(),
            queue: JobQueue::with_capacity(config.queue_capacity),
            workers: WorkerRegistry::new(),
            running: HashMap::new(),
            ledger: StatsLedger::default(),
            next_seq: 1,
            job_timeout: config.job_timeout(),
            recovery_delay: (
                Duration::from_millis(config.recovery_delay_min_ms),
                Duration::from_millis(config.recovery_delay_max_ms),
            ),
            rng,
            sink,
            started: Instant::now(),
        }
    }

    // ---------------------------------------------------------------------
    // Read access
    // ---------------------------------------------------------------------

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    /// All jobs sorted chronologically by creation order
    pub fn jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn ledger(&self) -> &StatsLedger {
        &self.ledger
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    // ---------------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------------

    /// Admit a new job to the table and queue it as Pending.
    pub fn submit(&mut self, spec: JobSpec, now: Instant) -> Result<JobId> {
        if self.queue.is_full() {
            return Err(SimError::QueueFull);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let job_id = format!("job-{:06}", seq);
        let job = Job::new(job_id.clone(), seq, spec, now, self.job_timeout);

        self.queue.enqueue(&job);
        self.sink.emit(ClusterEvent::JobCreated {
            job_id: job_id.clone(),
            name: job.name.clone(),
            job_type: job.job_type(),
            priority: job.priority,
        });
        self.jobs.insert(job_id.clone(), job);
        self.ledger.record_created();
        Ok(job_id)
    }

    /// Pop the next pending job id.
    pub fn dequeue(&mut self) -> Result<JobId> {
        self.queue.dequeue()
    }

    /// Put a dequeued job back without changing its state.
    pub(crate) fn return_to_queue(&mut self, job_id: &str) -> Result<()> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| SimError::JobNotFound(job_id.to_string()))?;
        self.queue.enqueue(job);
        Ok(())
    }

    /// Pending -> Running on `worker_id`.
    pub fn assign(&mut self, job_id: &str, worker_id: &str, now: Instant) -> Result<Assignment> {
        let worker = self
            .workers
            .get(worker_id)
            .ok_or_else(|| SimError::WorkerNotFound(worker_id.to_string()))?;
        if !worker.is_available() {
            return Err(SimError::WorkerFailed(worker_id.to_string()));
        }

        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SimError::JobNotFound(job_id.to_string()))?;
        job.ensure_transition(JobStatus::Running)?;

        job.status = JobStatus::Running;
        job.assigned_worker = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.first_started_at.get_or_insert(now);
        let assignment = Assignment {
            job_id: job.id.clone(),
            worker_id: worker_id.to_string(),
            attempt: job.attempts,
            params: job.params.clone(),
            deadline: job.deadline,
            cancel: CancellationToken::new(),
        };

        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.current_job = Some(job_id.to_string());
        }
        self.running
            .insert(job_id.to_string(), assignment.cancel.clone());
        self.sink.emit(ClusterEvent::JobAssigned {
            job_id: assignment.job_id.clone(),
            worker_id: assignment.worker_id.clone(),
            attempt: assignment.attempt,
        });
        Ok(assignment)
    }

    /// Check that `job_id` is still Running as `attempt` on `worker_id` and
    /// may move to `next`.
    fn check_current(
        &self,
        job_id: &str,
        worker_id: &str,
        attempt: u32,
        next: JobStatus,
    ) -> Result<()> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| SimError::JobNotFound(job_id.to_string()))?;
        if !job.status.can_transition_to(next)
            || job.attempts != attempt
            || job.assigned_worker.as_deref() != Some(worker_id)
        {
            return Err(SimError::StaleReport(job_id.to_string()));
        }
        Ok(())
    }

    /// Running -> Completed. Reports for an attempt that already ended are
    /// rejected with [`SimError::StaleReport`].
    pub fn complete(
        &mut self,
        job_id: &str,
        worker_id: &str,
        attempt: u32,
        now: Instant,
    ) -> Result<()> {
        self.check_current(job_id, worker_id, attempt, JobStatus::Completed)?;

        let Some(job) = self.jobs.get_mut(job_id) else {
            return Err(SimError::JobNotFound(job_id.to_string()));
        };
        job.status = JobStatus::Completed;
        job.assigned_worker = None;
        job.completed_at = Some(now);
        let latency = job.latency().unwrap_or_default();
        let turnaround = job.turnaround().unwrap_or_default();

        self.release_slot(worker_id, job_id);
        self.running.remove(job_id);
        self.ledger.record_completed(latency, turnaround);
        self.sink.emit(ClusterEvent::JobCompleted {
            job_id: job_id.to_string(),
            worker_id: worker_id.to_string(),
            attempt,
        });
        Ok(())
    }

    /// Running -> Failed for a specific attempt (execution error or timeout).
    pub fn fail(
        &mut self,
        job_id: &str,
        worker_id: &str,
        attempt: u32,
        reason: FailureReason,
    ) -> Result<RecoveryTicket> {
        self.check_current(job_id, worker_id, attempt, JobStatus::Failed)?;
        self.release_slot(worker_id, job_id);
        self.fail_running(job_id, reason)
    }

    fn release_slot(&mut self, worker_id: &str, job_id: &str) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            if worker.current_job.as_deref() == Some(job_id) {
                worker.current_job = None;
            }
        }
    }

    /// Mark a Running job Failed, cancel its execution unit and issue a
    /// recovery ticket. The caller has already freed the worker slot.
    fn fail_running(&mut self, job_id: &str, reason: FailureReason) -> Result<RecoveryTicket> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SimError::JobNotFound(job_id.to_string()))?;
        job.ensure_transition(JobStatus::Failed)?;

        let worker_id = job.assigned_worker.take();
        let attempt = job.attempts;
        job.error = Some(match &reason {
            FailureReason::Timeout => SimError::JobTimeout(job_id.to_string()).to_string(),
            FailureReason::WorkerCrashed | FailureReason::HeartbeatLost => {
                SimError::WorkerFailed(worker_id.clone().unwrap_or_default()).to_string()
            }
            FailureReason::ExecutionError(msg) => msg.clone(),
        });
        job.status = JobStatus::Failed;
        job.failures.push(FailureRecord {
            attempt,
            worker_id: worker_id.clone(),
            reason: reason.clone(),
        });
        job.attempts += 1;
        let ticket = RecoveryTicket {
            job_id: job_id.to_string(),
            failure_index: job.failures.len(),
        };

        if let Some(cancel) = self.running.remove(job_id) {
            cancel.cancel();
        }
        self.ledger.record_failure(&reason);
        self.sink.emit(ClusterEvent::JobFailed {
            job_id: job_id.to_string(),
            worker_id,
            attempt,
            reason,
        });
        Ok(ticket)
    }

    /// Force-fail every Running job whose deadline has passed.
    pub fn expire_overdue(&mut self, now: Instant) -> Vec<RecoveryTicket> {
        let overdue: Vec<(JobId, WorkerId, u32)> = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && now > j.deadline)
            .filter_map(|j| {
                j.assigned_worker
                    .clone()
                    .map(|w| (j.id.clone(), w, j.attempts))
            })
            .collect();

        overdue
            .into_iter()
            .filter_map(|(job_id, worker_id, attempt)| {
                self.fail(&job_id, &worker_id, attempt, FailureReason::Timeout)
                    .ok()
            })
            .collect()
    }

    /// Failed -> Pending, back in the queue with a fresh deadline.
    pub fn requeue(&mut self, job_id: &str, now: Instant) -> Result<()> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SimError::JobNotFound(job_id.to_string()))?;
        job.ensure_transition(JobStatus::Pending)?;
        job.status = JobStatus::Pending;
        job.started_at = None;
        job.deadline = now + self.job_timeout;
        let attempt = job.attempts;
        if !self.queue.enqueue(job) {
            return Err(SimError::InvariantViolation(format!(
                "job {} was already queued",
                job_id
            )));
        }
        self.sink.emit(ClusterEvent::JobRequeued {
            job_id: job_id.to_string(),
            attempt,
        });
        Ok(())
    }

    /// Failed -> Abandoned once the job has used up `retry_limit` retries.
    pub fn abandon(&mut self, job_id: &str, retry_limit: u32) -> Result<()> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SimError::JobNotFound(job_id.to_string()))?;
        job.ensure_transition(JobStatus::Abandoned)?;
        job.status = JobStatus::Abandoned;
        job.error = Some(SimError::RetryLimitExceeded(job_id.to_string(), retry_limit).to_string());
        let attempts = job.attempts;
        self.ledger.record_abandoned();
        self.sink.emit(ClusterEvent::JobAbandoned {
            job_id: job_id.to_string(),
            attempts,
        });
        Ok(())
    }

    /// Tickets for every Failed job, for recovery sweeps.
    pub fn unrecovered_failures(&self) -> Vec<RecoveryTicket> {
        let mut tickets: Vec<(u64, RecoveryTicket)> = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed)
            .map(|j| {
                (
                    j.seq,
                    RecoveryTicket {
                        job_id: j.id.clone(),
                        failure_index: j.failures.len(),
                    },
                )
            })
            .collect();
        tickets.sort_by_key(|(seq, _)| *seq);
        tickets.into_iter().map(|(_, t)| t).collect()
    }

    /// Drop the oldest Completed/Abandoned jobs beyond `keep`. Returns the
    /// number of jobs removed. Stats totals are unaffected.
    pub fn prune_finished(&mut self, keep: usize) -> usize {
        let mut finished: Vec<(u64, JobId)> = self
            .jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .map(|j| (j.seq, j.id.clone()))
            .collect();
        if finished.len() <= keep {
            return 0;
        }
        finished.sort();
        let excess = finished.len() - keep;
        for (_, job_id) in finished.into_iter().take(excess) {
            self.jobs.remove(&job_id);
        }
        excess
    }

    // ---------------------------------------------------------------------
    // Workers
    // ---------------------------------------------------------------------

    pub fn add_worker(&mut self, worker_id: &str, failure_rate: f64, now: Instant) -> Result<()> {
        validate_failure_rate(failure_rate)?;
        self.workers
            .register(worker_id.to_string(), failure_rate, now)?;
        self.sink.emit(ClusterEvent::WorkerAdded {
            worker_id: worker_id.to_string(),
            failure_rate,
        });
        Ok(())
    }

    pub fn heartbeat(&mut self, worker_id: &str, at: Instant) -> Result<HeartbeatOutcome> {
        let outcome = self.workers.heartbeat(worker_id, at)?;
        if outcome == HeartbeatOutcome::Revived {
            self.sink.emit(ClusterEvent::WorkerHealthy {
                worker_id: worker_id.to_string(),
            });
        }
        Ok(outcome)
    }

    pub fn mark_suspect(&mut self, worker_id: &str) -> Result<bool> {
        let changed = self.workers.mark_suspect(worker_id)?;
        if changed {
            self.sink.emit(ClusterEvent::WorkerSuspect {
                worker_id: worker_id.to_string(),
            });
        }
        Ok(changed)
    }

    /// Healthy/Suspect -> Failed. The in-flight job, if any, is failed in the
    /// same step and its recovery ticket returned.
    pub fn fail_worker(
        &mut self,
        worker_id: &str,
        reason: FailureReason,
        now: Instant,
    ) -> Result<Option<RecoveryTicket>> {
        let rng = &self.rng;
        let (min_delay, max_delay) = self.recovery_delay;
        let Some(prior_job) = self.workers.mark_failed(worker_id, reason.clone(), || {
            now + rng.duration_between(min_delay, max_delay)
        })?
        else {
            return Ok(None);
        };

        self.ledger.record_worker_failure();
        self.sink.emit(ClusterEvent::WorkerFailed {
            worker_id: worker_id.to_string(),
            reason: reason.clone(),
        });

        match prior_job {
            Some(job_id) => self.fail_running(&job_id, reason).map(Some),
            None => Ok(None),
        }
    }

    /// Failed -> Healthy once the recovery timer has elapsed.
    pub fn recover_worker(&mut self, worker_id: &str, now: Instant) -> Result<bool> {
        let recovered = self.workers.recover(worker_id, now)?;
        if recovered {
            self.ledger.record_worker_recovery();
            self.sink.emit(ClusterEvent::WorkerRecovered {
                worker_id: worker_id.to_string(),
            });
        }
        Ok(recovered)
    }

    pub fn set_heartbeats_muted(&mut self, worker_id: &str, muted: bool) -> Result<()> {
        self.workers.set_muted(worker_id, muted)
    }

    pub fn cache_resources(&mut self, worker_id: &str, snapshot: Arc<ResourceSnapshot>) {
        self.workers.cache_resources(worker_id, snapshot);
    }

    // ---------------------------------------------------------------------
    // Invariants
    // ---------------------------------------------------------------------

    /// Verify the job/worker cross-references. A violation is unrecoverable.
    pub fn check_invariants(&self) -> Result<()> {
        for job in self.jobs.values() {
            match (&job.status, &job.assigned_worker) {
                (JobStatus::Running, Some(worker_id)) => {
                    let owner = self
                        .workers
                        .get(worker_id)
                        .and_then(|w| w.current_job.as_deref());
                    if owner != Some(job.id.as_str()) {
                        return Err(SimError::InvariantViolation(format!(
                            "job {} running on {} but the worker does not hold it",
                            job.id, worker_id
                        )));
                    }
                }
                (JobStatus::Running, None) => {
                    return Err(SimError::InvariantViolation(format!(
                        "job {} running without a worker",
                        job.id
                    )));
                }
                (status, Some(worker_id)) => {
                    return Err(SimError::InvariantViolation(format!(
                        "job {} is {} but still assigned to {}",
                        job.id, status, worker_id
                    )));
                }
                _ => {}
            }
        }

        for worker in self.workers.all() {
            if let Some(job_id) = &worker.current_job {
                if worker.health == WorkerHealth::Failed {
                    return Err(SimError::InvariantViolation(format!(
                        "failed worker {} still holds job {}",
                        worker.id, job_id
                    )));
                }
                let running_here = self.jobs.get(job_id).is_some_and(|j| {
                    j.status == JobStatus::Running
                        && j.assigned_worker.as_deref() == Some(worker.id.as_str())
                });
                if !running_here {
                    return Err(SimError::InvariantViolation(format!(
                        "worker {} holds job {} which is not running there",
                        worker.id, job_id
                    )));
                }
            }
        }

        Ok(())
    }
}
