use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::scheduler::job::{FailureReason, JobStatus};
use crate::state::ClusterState;
use crate::worker::registry::WorkerHealth;

/// Running totals kept alongside the job table.
///
/// Totals survive pruning of finished jobs, so counters keep growing for the
/// lifetime of the process.
#[derive(Debug, Default, Clone)]
pub struct StatsLedger {
    pub created: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub worker_crashes: u64,
    pub heartbeat_losses: u64,
    pub timeouts: u64,
    pub execution_errors: u64,
    pub worker_failures: u64,
    pub worker_recoveries: u64,
    latency_total: Duration,
    turnaround_total: Duration,
}

impl StatsLedger {
    pub(crate) fn record_created(&mut self) {
        self.created += 1;
    }

    pub(crate) fn record_completed(&mut self, latency: Duration, turnaround: Duration) {
        self.completed += 1;
        self.latency_total += latency;
        self.turnaround_total += turnaround;
    }

    pub(crate) fn record_failure(&mut self, reason: &FailureReason) {
        match reason {
            FailureReason::WorkerCrashed => self.worker_crashes += 1,
            FailureReason::HeartbeatLost => self.heartbeat_losses += 1,
            FailureReason::Timeout => self.timeouts += 1,
            FailureReason::ExecutionError(_) => self.execution_errors += 1,
        }
    }

    pub(crate) fn record_abandoned(&mut self) {
        self.abandoned += 1;
    }

    pub(crate) fn record_worker_failure(&mut self) {
        self.worker_failures += 1;
    }

    pub(crate) fn record_worker_recovery(&mut self) {
        self.worker_recoveries += 1;
    }

    pub fn average_latency(&self) -> Option<Duration> {
        average(self.latency_total, self.completed)
    }

    pub fn average_turnaround(&self) -> Option<Duration> {
        average(self.turnaround_total, self.completed)
    }
}

fn average(total: Duration, count: u64) -> Option<Duration> {
    if count == 0 {
        return None;
    }
    Some(total / count.min(u32::MAX as u64) as u32)
}

/// Failed attempts broken down by cause.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureBreakdown {
    pub worker_crashed: u64,
    pub heartbeat_lost: u64,
    pub timeout: u64,
    pub execution_error: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub total_jobs: u64,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub failed_jobs: usize,
    pub completed_jobs: u64,
    pub abandoned_jobs: u64,
    pub queue_depth: usize,
    pub failures: FailureBreakdown,
    pub worker_failures: u64,
    pub worker_recoveries: u64,
    pub per_worker_failures: BTreeMap<String, u64>,
    pub healthy_workers: usize,
    pub suspect_workers: usize,
    pub failed_workers: usize,
    pub avg_latency_ms: Option<u64>,
    pub avg_turnaround_ms: Option<u64>,
    /// Completed jobs per minute since the cluster started.
    pub throughput_per_minute: f64,
    pub uptime_secs: f64,
}

impl ClusterStats {
    /// Derive the counters from a consistent view of the cluster.
    pub fn collect(state: &ClusterState, now: Instant) -> Self {
        let ledger = state.ledger();

        let (mut pending, mut running, mut failed) = (0, 0, 0);
        for job in state.jobs() {
            match job.status {
                JobStatus::Pending => pending += 1,
                JobStatus::Running => running += 1,
                JobStatus::Failed => failed += 1,
                JobStatus::Completed | JobStatus::Abandoned => {}
            }
        }

        let (mut healthy, mut suspect, mut down) = (0, 0, 0);
        let mut per_worker_failures = BTreeMap::new();
        for worker in state.workers().all() {
            match worker.health {
                WorkerHealth::Healthy => healthy += 1,
                WorkerHealth::Suspect => suspect += 1,
                WorkerHealth::Failed => down += 1,
            }
            per_worker_failures.insert(worker.id.clone(), worker.failure_count);
        }

        let uptime = now.saturating_duration_since(state.started());
        let minutes = uptime.as_secs_f64() / 60.0;
        let throughput_per_minute = if minutes > 0.0 {
            ledger.completed as f64 / minutes
        } else {
            0.0
        };

        Self {
            total_jobs: ledger.created,
            pending_jobs: pending,
            running_jobs: running,
            failed_jobs: failed,
            completed_jobs: ledger.completed,
            abandoned_jobs: ledger.abandoned,
            queue_depth: state.queue().len(),
            failures: FailureBreakdown {
                worker_crashed: ledger.worker_crashes,
                heartbeat_lost: ledger.heartbeat_losses,
                timeout: ledger.timeouts,
                execution_error: ledger.execution_errors,
            },
            worker_failures: ledger.worker_failures,
            worker_recoveries: ledger.worker_recoveries,
            per_worker_failures,
            healthy_workers: healthy,
            suspect_workers: suspect,
            failed_workers: down,
            avg_latency_ms: ledger.average_latency().map(|d| d.as_millis() as u64),
            avg_turnaround_ms: ledger.average_turnaround().map(|d| d.as_millis() as u64),
            throughput_per_minute,
            uptime_secs: uptime.as_secs_f64(),
        }
    }
}
