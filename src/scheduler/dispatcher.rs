use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SimError};
use crate::scheduler::job::WorkerId;
use crate::state::{Assignment, ClusterState, RecoveryTicket};
use crate::worker::executor::JobExecutor;
use crate::worker::probe::ResourceProbe;

/// Finished jobs kept in the job table for the read model.
const FINISHED_JOB_RETENTION: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Lowest GPU utilization, then lowest failure rate, then id.
    LeastUtilized,
    /// Resource metrics unavailable: next idle worker after the last pick.
    RoundRobin,
}

/// Matches pending jobs to idle Healthy workers.
pub struct Dispatcher {
    probe: Arc<dyn ResourceProbe>,
    executor: JobExecutor,
    last_pick: Option<WorkerId>,
}

impl Dispatcher {
    pub fn new(probe: Arc<dyn ResourceProbe>, executor: JobExecutor) -> Self {
        Self {
            probe,
            executor,
            last_pick: None,
        }
    }

    /// Pick a worker for the next job, or `None` if no idle Healthy worker
    /// can take one.
    pub fn select_worker(
        &mut self,
        state: &mut ClusterState,
    ) -> Option<(WorkerId, SelectionPolicy)> {
        let idle: Vec<(WorkerId, f64)> = state
            .workers()
            .available()
            .into_iter()
            .map(|w| (w.id.clone(), w.failure_rate))
            .collect();
        if idle.is_empty() {
            return None;
        }

        let mut readings = Vec::with_capacity(idle.len());
        for (worker_id, failure_rate) in &idle {
            match self.probe.snapshot(worker_id) {
                Ok(snapshot) => readings.push((worker_id.clone(), *failure_rate, Arc::new(snapshot))),
                Err(e) => {
                    tracing::debug!(worker_id = %worker_id, error = %e, "Falling back to round-robin selection");
                    let picked = self.round_robin(&idle);
                    return picked.map(|id| (id, SelectionPolicy::RoundRobin));
                }
            }
        }

        for (worker_id, _, snapshot) in &readings {
            state.cache_resources(worker_id, snapshot.clone());
        }

        let picked = readings
            .into_iter()
            .filter(|(_, _, snapshot)| snapshot.available)
            .min_by(|a, b| {
                a.2.utilization_pct
                    .total_cmp(&b.2.utilization_pct)
                    .then_with(|| a.1.total_cmp(&b.1))
                    .then_with(|| a.0.cmp(&b.0))
            })
            .map(|(id, _, _)| id)?;

        self.last_pick = Some(picked.clone());
        Some((picked, SelectionPolicy::LeastUtilized))
    }

    /// `idle` is ordered by id.
    fn round_robin(&mut self, idle: &[(WorkerId, f64)]) -> Option<WorkerId> {
        let next = match &self.last_pick {
            Some(last) => idle
                .iter()
                .find(|(id, _)| id > last)
                .or_else(|| idle.first()),
            None => idle.first(),
        }
        .map(|(id, _)| id.clone())?;
        self.last_pick = Some(next.clone());
        Some(next)
    }

    /// Assign queued jobs while the queue is non-empty and a worker is free.
    ///
    /// Only fatal errors are returned; anything else stops this round and
    /// leaves the job queued.
    pub fn dispatch(&mut self, state: &mut ClusterState, now: Instant) -> Result<Vec<Assignment>> {
        let mut assignments = Vec::new();

        while !state.queue().is_empty() {
            let Some((worker_id, policy)) = self.select_worker(state) else {
                break;
            };
            let job_id = match state.dequeue() {
                Ok(job_id) => job_id,
                Err(SimError::EmptyQueue) => break,
                Err(e) => return Err(e),
            };

            match state.assign(&job_id, &worker_id, now) {
                Ok(assignment) => {
                    tracing::debug!(job_id = %job_id, worker_id = %worker_id, policy = ?policy, "Dispatched job");
                    assignments.push(assignment);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, worker_id = %worker_id, error = %e, "Assignment rejected");
                    state.return_to_queue(&job_id)?;
                    break;
                }
            }
        }

        Ok(assignments)
    }

    /// One scheduling tick: expire overdue jobs, dispatch, verify invariants.
    pub fn tick(
        &mut self,
        state: &mut ClusterState,
        now: Instant,
    ) -> Result<(Vec<Assignment>, Vec<RecoveryTicket>)> {
        let tickets = state.expire_overdue(now);
        let assignments = self.dispatch(state, now)?;
        state.check_invariants()?;
        let pruned = state.prune_finished(FINISHED_JOB_RETENTION);
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned finished jobs");
        }
        Ok((assignments, tickets))
    }

    /// Scheduler loop. Each assignment gets its own execution task so a
    /// long job never blocks dispatching.
    ///
    /// A fatal invariant violation cancels `shutdown` and stops the cluster.
    pub async fn run(
        mut self,
        state: Arc<RwLock<ClusterState>>,
        recovery_tx: mpsc::UnboundedSender<RecoveryTicket>,
        tick: Duration,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(tick);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let result = {
                let mut state = state.write().await;
                self.tick(&mut state, Instant::now())
            };

            let (assignments, tickets) = match result {
                Ok(work) => work,
                Err(e) => {
                    tracing::error!(error = %e, "Cluster state corrupted, halting");
                    shutdown.cancel();
                    break;
                }
            };

            for ticket in tickets {
                if recovery_tx.send(ticket).is_err() {
                    tracing::debug!("Recovery channel closed");
                }
            }

            for assignment in assignments {
                let executor = self.executor.clone();
                let state = state.clone();
                let recovery_tx = recovery_tx.clone();
                tokio::spawn(async move {
                    executor.run(assignment, state, recovery_tx).await;
                });
            }
        }
    }
}
