use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{Result, SimError};
use crate::scheduler::job::{FailureReason, JobId, WorkerId};
use crate::worker::probe::ResourceSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Healthy,
    /// Missed at least one heartbeat, not yet timed out.
    Suspect,
    Failed,
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerHealth::Healthy => write!(f, "healthy"),
            WorkerHealth::Suspect => write!(f, "suspect"),
            WorkerHealth::Failed => write!(f, "failed"),
        }
    }
}

/// A logical worker node with a single execution slot.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: WorkerId,
    /// Probability of a crash per minute.
    pub failure_rate: f64,
    pub health: WorkerHealth,
    pub last_heartbeat: Instant,
    pub current_job: Option<JobId>,
    pub resources: Option<Arc<ResourceSnapshot>>,
    pub failure_count: u64,
    pub recovery_count: u64,
    pub last_failure: Option<FailureReason>,
    /// When a Failed worker comes back.
    pub recover_at: Option<Instant>,
    /// A muted worker stays up but stops heartbeating.
    pub heartbeats_muted: bool,
}

impl Worker {
    pub fn new(id: WorkerId, failure_rate: f64, now: Instant) -> Self {
        Self {
            id,
            failure_rate,
            health: WorkerHealth::Healthy,
            last_heartbeat: now,
            current_job: None,
            resources: None,
            failure_count: 0,
            recovery_count: 0,
            last_failure: None,
            recover_at: None,
            heartbeats_muted: false,
        }
    }

    /// Healthy and not running anything.
    pub fn is_available(&self) -> bool {
        self.health == WorkerHealth::Healthy && self.current_job.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Accepted,
    /// The worker was Suspect and is Healthy again.
    Revived,
    /// Not newer than the last recorded heartbeat.
    Stale,
    /// The worker is Failed; only its recovery timer brings it back.
    Ignored,
}

/// Worker health and slot bookkeeping.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<WorkerId, Worker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker_id: WorkerId, failure_rate: f64, now: Instant) -> Result<()> {
        if self.workers.contains_key(&worker_id) {
            return Err(SimError::DuplicateWorker(worker_id));
        }
        self.workers
            .insert(worker_id.clone(), Worker::new(worker_id, failure_rate, now));
        Ok(())
    }

    pub fn get(&self, worker_id: &str) -> Option<&Worker> {
        self.workers.get(worker_id)
    }

    pub fn get_mut(&mut self, worker_id: &str) -> Option<&mut Worker> {
        self.workers.get_mut(worker_id)
    }

    fn require_mut(&mut self, worker_id: &str) -> Result<&mut Worker> {
        self.workers
            .get_mut(worker_id)
            .ok_or_else(|| SimError::WorkerNotFound(worker_id.to_string()))
    }

    /// All workers ordered by id
    pub fn all(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Healthy workers with a free slot, ordered by id
    pub fn available(&self) -> Vec<&Worker> {
        self.workers.values().filter(|w| w.is_available()).collect()
    }

    /// Record a heartbeat observed at `at`.
    pub fn heartbeat(&mut self, worker_id: &str, at: Instant) -> Result<HeartbeatOutcome> {
        let worker = self.require_mut(worker_id)?;
        if worker.health == WorkerHealth::Failed {
            return Ok(HeartbeatOutcome::Ignored);
        }
        if at <= worker.last_heartbeat {
            return Ok(HeartbeatOutcome::Stale);
        }
        worker.last_heartbeat = at;
        if worker.health == WorkerHealth::Suspect {
            worker.health = WorkerHealth::Healthy;
            return Ok(HeartbeatOutcome::Revived);
        }
        Ok(HeartbeatOutcome::Accepted)
    }

    /// Healthy -> Suspect. Returns false if the worker was not Healthy.
    pub fn mark_suspect(&mut self, worker_id: &str) -> Result<bool> {
        let worker = self.require_mut(worker_id)?;
        if worker.health != WorkerHealth::Healthy {
            return Ok(false);
        }
        worker.health = WorkerHealth::Suspect;
        Ok(true)
    }

    /// Healthy/Suspect -> Failed, freeing the slot.
    ///
    /// Returns `None` when the worker is already Failed, otherwise the job it
    /// was running (if any) so the caller can hand it to recovery.
    pub fn mark_failed(
        &mut self,
        worker_id: &str,
        reason: FailureReason,
        recover_at: impl FnOnce() -> Instant,
    ) -> Result<Option<Option<JobId>>> {
        let worker = self.require_mut(worker_id)?;
        if worker.health == WorkerHealth::Failed {
            return Ok(None);
        }
        worker.health = WorkerHealth::Failed;
        worker.failure_count += 1;
        worker.last_failure = Some(reason);
        worker.recover_at = Some(recover_at());
        worker.resources = None;
        Ok(Some(worker.current_job.take()))
    }

    /// Failed -> Healthy with an empty slot.
    pub fn recover(&mut self, worker_id: &str, now: Instant) -> Result<bool> {
        let worker = self.require_mut(worker_id)?;
        if worker.health != WorkerHealth::Failed {
            return Ok(false);
        }
        worker.health = WorkerHealth::Healthy;
        worker.current_job = None;
        worker.recover_at = None;
        worker.last_heartbeat = now;
        worker.recovery_count += 1;
        Ok(true)
    }

    /// Failed workers whose recovery timer has elapsed
    pub fn due_for_recovery(&self, now: Instant) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.health == WorkerHealth::Failed)
            .filter(|w| w.recover_at.is_some_and(|at| at <= now))
            .map(|w| w.id.clone())
            .collect()
    }

    pub fn set_muted(&mut self, worker_id: &str, muted: bool) -> Result<()> {
        self.require_mut(worker_id)?.heartbeats_muted = muted;
        Ok(())
    }

    pub fn cache_resources(&mut self, worker_id: &str, snapshot: Arc<ResourceSnapshot>) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.resources = Some(snapshot);
        }
    }
}
