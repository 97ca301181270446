//! Fault recovery: reclaims jobs orphaned by worker failures and timeouts.
//!
//! Every failed attempt produces a [`RecoveryTicket`]. Tickets normally
//! arrive over a channel right after the failure; a periodic sweep also
//! issues tickets for any Failed job still waiting, so a lost ticket never
//! strands a job. A ticket is honoured only while its job is still Failed
//! with the same failure count, so duplicate tickets requeue at most once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::scheduler::job::JobStatus;
use crate::state::{ClusterState, RecoveryTicket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Back in the queue as Pending for this attempt.
    Requeued { attempt: u32 },
    /// Retry limit exceeded.
    Abandoned { attempts: u32 },
    /// Another ticket already handled this failure.
    AlreadyHandled,
}

#[derive(Debug, Clone)]
pub struct FaultRecovery {
    retry_limit: u32,
    sweep_interval: Duration,
}

impl FaultRecovery {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            retry_limit: config.retry_limit,
            sweep_interval: config.recovery_sweep(),
        }
    }

    /// Requeue or abandon the job named by `ticket`.
    pub fn recover(
        &self,
        state: &mut ClusterState,
        ticket: &RecoveryTicket,
        now: Instant,
    ) -> Result<RecoveryOutcome> {
        let job = state
            .job(&ticket.job_id)
            .ok_or_else(|| SimError::JobNotFound(ticket.job_id.clone()))?;
        if job.status != JobStatus::Failed || job.failures.len() != ticket.failure_index {
            return Ok(RecoveryOutcome::AlreadyHandled);
        }

        let attempts = job.attempts;
        if attempts <= self.retry_limit {
            state.requeue(&ticket.job_id, now)?;
            Ok(RecoveryOutcome::Requeued { attempt: attempts })
        } else {
            state.abandon(&ticket.job_id, self.retry_limit)?;
            Ok(RecoveryOutcome::Abandoned { attempts })
        }
    }

    /// Recover every Failed job in the table.
    pub fn sweep(&self, state: &mut ClusterState, now: Instant) -> Vec<RecoveryOutcome> {
        state
            .unrecovered_failures()
            .iter()
            .filter_map(|ticket| match self.recover(state, ticket, now) {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    tracing::error!(job_id = %ticket.job_id, error = %e, "Recovery sweep failed");
                    None
                }
            })
            .collect()
    }

    /// Handle tickets as they arrive and sweep on a fixed interval.
    pub async fn run(
        self,
        state: Arc<RwLock<ClusterState>>,
        mut tickets: mpsc::UnboundedReceiver<RecoveryTicket>,
        shutdown: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(self.sweep_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                ticket = tickets.recv() => {
                    let Some(ticket) = ticket else {
                        break;
                    };
                    let mut state = state.write().await;
                    if let Err(e) = self.recover(&mut state, &ticket, Instant::now()) {
                        tracing::error!(job_id = %ticket.job_id, error = %e, "Job recovery failed");
                        if e.is_fatal() {
                            shutdown.cancel();
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    let mut state = state.write().await;
                    let recovered = self.sweep(&mut state, Instant::now());
                    if !recovered.is_empty() {
                        tracing::debug!(count = recovered.len(), "Recovery sweep reclaimed jobs");
                    }
                }
            }
        }
    }
}
