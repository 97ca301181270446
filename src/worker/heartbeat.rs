use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SimConfig;
use crate::rng::SimRng;
use crate::scheduler::job::FailureReason;
use crate::state::{ClusterState, RecoveryTicket};
use crate::worker::registry::WorkerHealth;

/// Polls every worker once per heartbeat interval.
///
/// Each tick, for every worker:
/// - a Failed worker whose recovery timer elapsed comes back Healthy,
/// - a Healthy worker may crash, with probability scaled from its per-minute
///   failure rate to the tick length,
/// - an up worker that is not muted emits a heartbeat, which can be lost,
/// - a worker silent for a full interval turns Suspect, and one silent past
///   the timeout is declared Failed.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    drop_probability: f64,
    rng: SimRng,
}

impl HeartbeatMonitor {
    pub fn new(config: &SimConfig, rng: SimRng) -> Self {
        Self {
            interval: config.heartbeat_interval(),
            timeout: config.heartbeat_timeout(),
            drop_probability: config.heartbeat_drop_probability,
            rng,
        }
    }

    /// Crash probability for one tick of a worker failing `rate` times a minute.
    pub fn crash_probability(&self, rate: f64) -> f64 {
        (rate * self.interval.as_secs_f64() / 60.0).clamp(0.0, 1.0)
    }

    /// Run one monitoring pass and return recovery tickets for jobs orphaned
    /// by failures.
    pub fn tick(&self, state: &mut ClusterState, now: Instant) -> Vec<RecoveryTicket> {
        let mut tickets = Vec::new();

        // Workers that come back this pass sit out the rest of it.
        let recovered = state.workers().due_for_recovery(now);
        for worker_id in &recovered {
            if let Err(e) = state.recover_worker(worker_id, now) {
                tracing::warn!(worker_id = %worker_id, error = %e, "Worker recovery failed");
            }
        }

        for worker_id in state.workers().ids() {
            if recovered.contains(&worker_id) {
                continue;
            }
            let Some(worker) = state.workers().get(&worker_id) else {
                continue;
            };
            let health = worker.health;
            let failure_rate = worker.failure_rate;
            let muted = worker.heartbeats_muted;

            if health == WorkerHealth::Failed {
                continue;
            }

            if health == WorkerHealth::Healthy && self.rng.chance(self.crash_probability(failure_rate))
            {
                match state.fail_worker(&worker_id, FailureReason::WorkerCrashed, now) {
                    Ok(ticket) => tickets.extend(ticket),
                    Err(e) => tracing::warn!(worker_id = %worker_id, error = %e, "Crash transition failed"),
                }
                continue;
            }

            if !muted && !self.rng.chance(self.drop_probability) {
                if let Err(e) = state.heartbeat(&worker_id, now) {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Heartbeat rejected");
                }
            }

            tickets.extend(self.check_liveness(state, &worker_id, now));
        }

        tickets
    }

    /// Apply the Suspect/Failed thresholds to one worker.
    pub fn check_liveness(
        &self,
        state: &mut ClusterState,
        worker_id: &str,
        now: Instant,
    ) -> Option<RecoveryTicket> {
        let worker = state.workers().get(worker_id)?;
        if worker.health == WorkerHealth::Failed {
            return None;
        }
        let silent_for = now.saturating_duration_since(worker.last_heartbeat);

        if silent_for > self.timeout {
            return match state.fail_worker(worker_id, FailureReason::HeartbeatLost, now) {
                Ok(ticket) => ticket,
                Err(e) => {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Heartbeat timeout transition failed");
                    None
                }
            };
        }

        if silent_for >= self.interval {
            if let Err(e) = state.mark_suspect(worker_id) {
                tracing::warn!(worker_id = %worker_id, error = %e, "Suspect transition failed");
            }
        }
        None
    }

    /// Run the monitor until `shutdown` fires.
    pub async fn run(
        self,
        state: Arc<RwLock<ClusterState>>,
        recovery_tx: mpsc::UnboundedSender<RecoveryTicket>,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let tickets = {
                let mut state = state.write().await;
                self.tick(&mut state, Instant::now())
            };

            for ticket in tickets {
                if recovery_tx.send(ticket).is_err() {
                    // Recovery sweep will pick the job up.
                    tracing::debug!("Recovery channel closed");
                }
            }
        }
    }
}
